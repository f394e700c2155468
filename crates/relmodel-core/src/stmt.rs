//! Abstract statements handed to the executor.
//!
//! relmodel never renders dialect SQL. The plan compiler and the persistence
//! coordinator emit these trees, and the [`Executor`](crate::Executor)
//! renders them for its backend. The `Display` impls produce a generic
//! SQL-like rendering that is only meant for logs and test assertions.

use crate::filter::{Filter, FilterOp};
use crate::value::Value;
use std::fmt;

/// A column qualified by the alias of the table it comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl BinaryOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
        }
    }
}

/// Predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Value(Value),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Value>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: String,
    },
    /// `expr IN (SELECT <single column> ...)`
    InSubquery {
        expr: Box<Expr>,
        query: Box<SelectStatement>,
        negated: bool,
    },
    /// Conjunction; an empty list is `TRUE`
    And(Vec<Expr>),
    /// Disjunction; an empty list is `FALSE`
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn col(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column(ColumnRef::new(table, column))
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Value(value.into())
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// `left = right`
    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOp::Eq, right)
    }

    /// `TRUE`
    pub fn true_() -> Self {
        Expr::And(Vec::new())
    }

    /// Combine predicates with `AND`, flattening nested conjunctions and
    /// collapsing a single operand.
    pub fn and_all(exprs: impl IntoIterator<Item = Expr>) -> Self {
        let mut flat = Vec::new();
        for expr in exprs {
            match expr {
                Expr::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or_else(Expr::true_)
        } else {
            Expr::And(flat)
        }
    }

    /// Combine predicates with `OR`, collapsing a single operand.
    pub fn or_all(exprs: impl IntoIterator<Item = Expr>) -> Self {
        let mut list: Vec<Expr> = exprs.into_iter().collect();
        if list.len() == 1 {
            list.pop().unwrap_or_else(|| Expr::Or(Vec::new()))
        } else {
            Expr::Or(list)
        }
    }

    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    /// Bind a column filter to a table alias.
    pub fn filter(table: &str, filter: &Filter) -> Self {
        let column = Expr::col(table, filter.column.as_str());
        match &filter.op {
            FilterOp::Eq(v) => Self::binary(column, BinaryOp::Eq, Expr::Value(v.clone())),
            FilterOp::NotEq(v) => Self::binary(column, BinaryOp::NotEq, Expr::Value(v.clone())),
            FilterOp::Gt(v) => Self::binary(column, BinaryOp::Gt, Expr::Value(v.clone())),
            FilterOp::Gte(v) => Self::binary(column, BinaryOp::Gte, Expr::Value(v.clone())),
            FilterOp::Lt(v) => Self::binary(column, BinaryOp::Lt, Expr::Value(v.clone())),
            FilterOp::Lte(v) => Self::binary(column, BinaryOp::Lte, Expr::Value(v.clone())),
            FilterOp::In(list) => Expr::InList {
                expr: Box::new(column),
                list: list.clone(),
                negated: false,
            },
            FilterOp::NotIn(list) => Expr::InList {
                expr: Box::new(column),
                list: list.clone(),
                negated: true,
            },
            FilterOp::IsNull => Expr::IsNull {
                expr: Box::new(column),
                negated: false,
            },
            FilterOp::IsNotNull => Expr::IsNull {
                expr: Box::new(column),
                negated: true,
            },
            FilterOp::Like(pattern) => Expr::Like {
                expr: Box::new(column),
                pattern: pattern.clone(),
            },
        }
    }

    /// Bind the negation of a column filter to a table alias.
    pub fn filter_not(table: &str, filter: &Filter) -> Self {
        match filter.op.negated() {
            Some(op) => Self::filter(table, &Filter::new(filter.column.clone(), op)),
            None => Self::not(Self::filter(table, filter)),
        }
    }

    /// Is this the trivially-true empty conjunction?
    pub fn is_true(&self) -> bool {
        matches!(self, Expr::And(list) if list.is_empty())
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// An ordering term bound to a table alias.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub direction: OrderDirection,
}

/// What a select returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Every column of the base alias
    All,
    /// Listed columns, in order
    Columns(Vec<ColumnRef>),
    /// A single `count` column
    Count,
    /// A single `min` column
    Min(ColumnRef),
    /// A single `max` column
    Max(ColumnRef),
}

/// JOIN type. Association joins are always inner joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub alias: String,
    pub on: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub projection: Projection,
    pub table: String,
    pub alias: String,
    pub joins: Vec<Join>,
    pub filter: Expr,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// `DISTINCT ON` column
    pub distinct: Option<ColumnRef>,
}

impl SelectStatement {
    /// `SELECT alias.* FROM table AS alias`
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            projection: Projection::All,
            table: table.into(),
            alias: alias.into(),
            joins: Vec::new(),
            filter: Expr::true_(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: None,
        }
    }
}

/// `INSERT ... RETURNING *`
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub values: Vec<(String, Value)>,
}

/// `UPDATE table SET ... WHERE filter`; filter columns use the table name as
/// their alias.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<(String, Value)>,
    pub filter: Expr,
}

/// `DELETE FROM table WHERE filter`
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub filter: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl Statement {
    /// The table the statement targets.
    pub fn table(&self) -> &str {
        match self {
            Statement::Select(s) => &s.table,
            Statement::Insert(s) => &s.table,
            Statement::Update(s) => &s.table,
            Statement::Delete(s) => &s.table,
        }
    }
}

impl From<SelectStatement> for Statement {
    fn from(stmt: SelectStatement) -> Self {
        Statement::Select(stmt)
    }
}

impl From<InsertStatement> for Statement {
    fn from(stmt: InsertStatement) -> Self {
        Statement::Insert(stmt)
    }
}

impl From<UpdateStatement> for Statement {
    fn from(stmt: UpdateStatement) -> Self {
        Statement::Update(stmt)
    }
}

impl From<DeleteStatement> for Statement {
    fn from(stmt: DeleteStatement) -> Self {
        Statement::Delete(stmt)
    }
}

fn fmt_list(f: &mut fmt::Formatter<'_>, values: &[Value]) -> fmt::Result {
    write!(f, "(")?;
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", v)?;
    }
    write!(f, ")")
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.\"{}\"", self.table, self.column)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{}", c),
            Expr::Value(v) => write!(f, "{}", v),
            Expr::Binary { left, op, right } => write!(f, "{} {} {}", left, op.as_str(), right),
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                write!(f, "{} {}IN ", expr, if *negated { "NOT " } else { "" })?;
                fmt_list(f, list)
            }
            Expr::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Expr::Like { expr, pattern } => write!(f, "{} LIKE '{}'", expr, pattern),
            Expr::InSubquery {
                expr,
                query,
                negated,
            } => write!(
                f,
                "{} {}IN ({})",
                expr,
                if *negated { "NOT " } else { "" },
                query
            ),
            Expr::And(list) if list.is_empty() => write!(f, "TRUE"),
            Expr::Or(list) if list.is_empty() => write!(f, "FALSE"),
            Expr::And(list) | Expr::Or(list) => {
                let sep = if matches!(self, Expr::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                write!(f, "(")?;
                for (i, e) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", sep)?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            Expr::Not(e) => write!(f, "NOT ({})", e),
        }
    }
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if let Some(distinct) = &self.distinct {
            write!(f, "DISTINCT ON ({}) ", distinct)?;
        }
        match &self.projection {
            Projection::All => write!(f, "{}.*", self.alias)?,
            Projection::Columns(cols) => {
                for (i, c) in cols.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", c)?;
                }
            }
            Projection::Count => write!(f, "COUNT(*)")?,
            Projection::Min(c) => write!(f, "MIN({})", c)?,
            Projection::Max(c) => write!(f, "MAX({})", c)?,
        }
        write!(f, " FROM \"{}\" AS {}", self.table, self.alias)?;
        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Inner => "INNER",
                JoinKind::Left => "LEFT",
            };
            write!(
                f,
                " {} JOIN \"{}\" AS {} ON {}",
                kind, join.table, join.alias, join.on
            )?;
        }
        if !self.filter.is_true() {
            write!(f, " WHERE {}", self.filter)?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY ")?;
            for (i, o) in self.order_by.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                let dir = match o.direction {
                    OrderDirection::Asc => "ASC",
                    OrderDirection::Desc => "DESC",
                };
                write!(f, "{} {}", o.column, dir)?;
            }
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {}", offset)?;
        }
        Ok(())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(s) => write!(f, "{}", s),
            Statement::Insert(s) => {
                write!(f, "INSERT INTO \"{}\" (", s.table)?;
                for (i, (col, _)) in s.values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\"", col)?;
                }
                write!(f, ") VALUES ")?;
                let values: Vec<Value> = s.values.iter().map(|(_, v)| v.clone()).collect();
                fmt_list(f, &values)?;
                write!(f, " RETURNING *")
            }
            Statement::Update(s) => {
                write!(f, "UPDATE \"{}\" SET ", s.table)?;
                for (i, (col, value)) in s.assignments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\" = ", col)?;
                    write!(f, "{}", value)?;
                }
                write!(f, " WHERE {}", s.filter)
            }
            Statement::Delete(s) => write!(f, "DELETE FROM \"{}\" WHERE {}", s.table, s.filter),
        }
    }
}
