//! Column filters.
//!
//! A [`Filter`] is a single `column <op> operand` comparison that has not yet
//! been bound to a table alias. Plans, scopes and association descriptors all
//! store filters in this unbound form; the plan compiler turns them into
//! [`Expr`](crate::stmt::Expr) trees once aliases are known.

use crate::stmt::OrderDirection;
use crate::value::Value;

/// Comparison applied to a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    NotEq(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    IsNull,
    IsNotNull,
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    /// SQL `LIKE` with `%` and `_` wildcards
    Like(String),
}

impl FilterOp {
    /// The logical complement of this comparison, where one exists without
    /// wrapping in `NOT`.
    pub fn negated(&self) -> Option<FilterOp> {
        Some(match self {
            FilterOp::Eq(v) => FilterOp::NotEq(v.clone()),
            FilterOp::NotEq(v) => FilterOp::Eq(v.clone()),
            FilterOp::In(v) => FilterOp::NotIn(v.clone()),
            FilterOp::NotIn(v) => FilterOp::In(v.clone()),
            FilterOp::IsNull => FilterOp::IsNotNull,
            FilterOp::IsNotNull => FilterOp::IsNull,
            FilterOp::Gt(v) => FilterOp::Lte(v.clone()),
            FilterOp::Gte(v) => FilterOp::Lt(v.clone()),
            FilterOp::Lt(v) => FilterOp::Gte(v.clone()),
            FilterOp::Lte(v) => FilterOp::Gt(v.clone()),
            FilterOp::Like(_) => return None,
        })
    }

    /// Whether `value` satisfies this comparison.
    ///
    /// NULL never compares equal to anything, mirroring SQL three-valued
    /// logic collapsed to `false`.
    pub fn matches(&self, value: &Value) -> bool {
        use std::cmp::Ordering;
        match self {
            FilterOp::IsNull => value.is_null(),
            FilterOp::IsNotNull => !value.is_null(),
            _ if value.is_null() => false,
            FilterOp::Eq(v) => !v.is_null() && value.key() == v.key(),
            FilterOp::NotEq(v) => !v.is_null() && value.key() != v.key(),
            FilterOp::In(list) => list.iter().any(|v| value.key() == v.key()),
            FilterOp::NotIn(list) => !list.iter().any(|v| value.key() == v.key()),
            FilterOp::Gt(v) => !v.is_null() && value.sort_cmp(v) == Ordering::Greater,
            FilterOp::Gte(v) => !v.is_null() && value.sort_cmp(v) != Ordering::Less,
            FilterOp::Lt(v) => !v.is_null() && value.sort_cmp(v) == Ordering::Less,
            FilterOp::Lte(v) => !v.is_null() && value.sort_cmp(v) != Ordering::Greater,
            FilterOp::Like(pattern) => value
                .as_str()
                .is_some_and(|text| like_matches(pattern, text)),
        }
    }
}

/// A comparison against one column of the model being filtered.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp) -> Self {
        Self {
            column: column.into(),
            op,
        }
    }

    /// `column = value`; a NULL value becomes `column IS NULL`.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if value.is_null() {
            Self::new(column, FilterOp::IsNull)
        } else {
            Self::new(column, FilterOp::Eq(value))
        }
    }

    pub fn not_eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if value.is_null() {
            Self::new(column, FilterOp::IsNotNull)
        } else {
            Self::new(column, FilterOp::NotEq(value))
        }
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, FilterOp::In(values))
    }

    pub fn not_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, FilterOp::NotIn(values))
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::IsNull)
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::IsNotNull)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Gt(value.into()))
    }

    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Gte(value.into()))
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Lt(value.into()))
    }

    pub fn lte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Lte(value.into()))
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Like(pattern.into()))
    }

    /// The single value this filter pins its column to, if it is an equality
    /// or a one-element `IN`.
    pub fn pinned_value(&self) -> Option<&Value> {
        match &self.op {
            FilterOp::Eq(v) => Some(v),
            FilterOp::In(list) if list.len() == 1 => list.first(),
            _ => None,
        }
    }
}

/// An ordering term on one column of the model being ordered.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub direction: OrderDirection,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Desc,
        }
    }

    /// The same column in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            column: self.column.clone(),
            direction: match self.direction {
                OrderDirection::Asc => OrderDirection::Desc,
                OrderDirection::Desc => OrderDirection::Asc,
            },
        }
    }
}

/// Match `text` against a SQL `LIKE` pattern.
pub fn like_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    like_from(&pattern, &text)
}

fn like_from(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => (0..=text.len()).any(|skip| like_from(rest, &text[skip..])),
        Some(('_', rest)) => !text.is_empty() && like_from(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && like_from(rest, &text[1..]),
    }
}
