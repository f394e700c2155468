//! Shared fixtures for integration tests: an in-memory executor that
//! evaluates abstract statements directly, and a blog-shaped schema.

#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use relmodel::{
    AssociationDescriptor as Assoc, BinaryOp, Cx, Error, Executor, Expr, Filter, FilterOp,
    HookContext, HookEvent, JoinKind, ModelBuilder, OrderDirection, Outcome, Projection,
    QueryError, QueryErrorKind, QueryResult, Row, SOFT_DELETE_SCOPE, Schema, SchemaBuilder,
    ScopeDescriptor, SelectStatement, Statement, TxnHandle, Value,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

pub type StoredRow = BTreeMap<String, Value>;
type Binding = HashMap<String, StoredRow>;

#[derive(Debug, Clone, Default)]
struct Db {
    tables: HashMap<String, Vec<StoredRow>>,
    next_id: HashMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct State {
    db: Db,
    snapshots: HashMap<u64, Db>,
    unique: Vec<(String, Vec<String>)>,
    fail_on: Option<(&'static str, String)>,
    next_txn: u64,
    pub log: Vec<Statement>,
    pub commits: usize,
    pub rollbacks: usize,
}

/// Evaluates statements against in-memory tables.
///
/// Transactions snapshot the whole store on `begin` and restore it on
/// `rollback`.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    state: Arc<Mutex<State>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("lock poisoned")
    }

    /// Reject inserts that duplicate `columns` in `table`.
    pub fn unique(self, table: &str, columns: &[&str]) -> Self {
        self.lock().unique.push((
            table.to_string(),
            columns.iter().map(|c| (*c).to_string()).collect(),
        ));
        self
    }

    /// Fail every `kind` statement (`"select"`, `"insert"`, `"update"`,
    /// `"delete"`) on `table`.
    pub fn fail_on(&self, kind: &'static str, table: &str) {
        self.lock().fail_on = Some((kind, table.to_string()));
    }

    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.lock().db.tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: i64) -> Option<StoredRow> {
        self.rows(table)
            .into_iter()
            .find(|r| r.get("id").and_then(Value::as_i64) == Some(id))
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    pub fn select_count(&self) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|s| matches!(s, Statement::Select(_)))
            .count()
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    fn run(&self, stmt: &Statement) -> Result<QueryResult, Error> {
        let mut state = self.lock();
        state.log.push(stmt.clone());
        let kind = match stmt {
            Statement::Select(_) => "select",
            Statement::Insert(_) => "insert",
            Statement::Update(_) => "update",
            Statement::Delete(_) => "delete",
        };
        if let Some((fail_kind, table)) = &state.fail_on {
            if *fail_kind == kind && table == stmt.table() {
                return Err(Error::Custom(format!("injected {} failure on {}", kind, table)));
            }
        }

        match stmt {
            Statement::Select(select) => Ok(QueryResult::from_rows(select_rows(&state.db, select))),
            Statement::Insert(insert) => {
                let mut stored: StoredRow = insert.values.iter().cloned().collect();
                for (table, columns) in &state.unique {
                    if *table != insert.table {
                        continue;
                    }
                    let taken = state.db.tables.get(table).is_some_and(|rows| {
                        rows.iter().any(|row| {
                            columns.iter().all(|c| {
                                let new = stored.get(c).unwrap_or(&Value::Null);
                                !new.is_null() && row.get(c).map(Value::key) == Some(new.key())
                            })
                        })
                    });
                    if taken {
                        return Err(Error::Query(QueryError {
                            kind: QueryErrorKind::Constraint,
                            sqlstate: Some("23505".to_string()),
                            message: format!("duplicate key in {} ({})", table, columns.join(", ")),
                            source: None,
                        }));
                    }
                }
                if stored.get("id").is_none_or(Value::is_null) {
                    let next = state.db.next_id.entry(insert.table.clone()).or_insert(0);
                    *next += 1;
                    stored.insert("id".to_string(), Value::BigInt(*next));
                }
                state
                    .db
                    .tables
                    .entry(insert.table.clone())
                    .or_default()
                    .push(stored.clone());
                Ok(QueryResult::from_rows(vec![to_row(&stored)]))
            }
            Statement::Update(update) => {
                let snapshot = state.db.clone();
                let rows = state.db.tables.entry(update.table.clone()).or_default();
                let mut affected = 0;
                for row in rows.iter_mut() {
                    let binding = bind(&update.table, row.clone());
                    if truthy(&snapshot, &binding, &update.filter) {
                        for (column, value) in &update.assignments {
                            row.insert(column.clone(), value.clone());
                        }
                        affected += 1;
                    }
                }
                Ok(QueryResult::affected(affected))
            }
            Statement::Delete(delete) => {
                let snapshot = state.db.clone();
                let rows = state.db.tables.entry(delete.table.clone()).or_default();
                let before = rows.len();
                rows.retain(|row| !truthy(&snapshot, &bind(&delete.table, row.clone()), &delete.filter));
                Ok(QueryResult::affected((before - rows.len()) as u64))
            }
        }
    }
}

impl Executor for MemoryExecutor {
    fn execute(
        &self,
        _cx: &Cx,
        stmt: &Statement,
        _txn: Option<TxnHandle>,
    ) -> impl Future<Output = Outcome<QueryResult, Error>> + Send {
        let result = self.run(stmt);
        async move {
            match result {
                Ok(r) => Outcome::Ok(r),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<TxnHandle, Error>> + Send {
        let mut state = self.lock();
        state.next_txn += 1;
        let id = state.next_txn;
        let snapshot = state.db.clone();
        state.snapshots.insert(id, snapshot);
        async move { Outcome::Ok(TxnHandle::new(id)) }
    }

    fn commit(&self, _cx: &Cx, txn: TxnHandle) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.lock();
        state.snapshots.remove(&txn.id());
        state.commits += 1;
        async { Outcome::Ok(()) }
    }

    fn rollback(&self, _cx: &Cx, txn: TxnHandle) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.lock();
        if let Some(snapshot) = state.snapshots.remove(&txn.id()) {
            state.db = snapshot;
        }
        state.rollbacks += 1;
        async { Outcome::Ok(()) }
    }
}

fn to_row(stored: &StoredRow) -> Row {
    Row::new(
        stored.keys().cloned().collect(),
        stored.values().cloned().collect(),
    )
}

fn bind(alias: &str, row: StoredRow) -> Binding {
    HashMap::from([(alias.to_string(), row)])
}

fn select_rows(db: &Db, select: &SelectStatement) -> Vec<Row> {
    let base = db.tables.get(&select.table).cloned().unwrap_or_default();
    let mut bindings: Vec<Binding> = base.into_iter().map(|row| bind(&select.alias, row)).collect();

    for join in &select.joins {
        let rows = db.tables.get(&join.table).cloned().unwrap_or_default();
        let mut next = Vec::new();
        for binding in bindings {
            let mut matched = false;
            for row in &rows {
                let mut candidate = binding.clone();
                candidate.insert(join.alias.clone(), row.clone());
                if truthy(db, &candidate, &join.on) {
                    next.push(candidate);
                    matched = true;
                }
            }
            if !matched && join.kind == JoinKind::Left {
                let mut candidate = binding.clone();
                candidate.insert(join.alias.clone(), StoredRow::new());
                next.push(candidate);
            }
        }
        bindings = next;
    }

    bindings.retain(|b| truthy(db, b, &select.filter));
    bindings.sort_by(|a, b| {
        for order in &select.order_by {
            let left = lookup(a, &order.column.table, &order.column.column);
            let right = lookup(b, &order.column.table, &order.column.column);
            let cmp = match order.direction {
                OrderDirection::Asc => left.sort_cmp(&right),
                OrderDirection::Desc => right.sort_cmp(&left),
            };
            if cmp.is_ne() {
                return cmp;
            }
        }
        std::cmp::Ordering::Equal
    });
    if let Some(distinct) = &select.distinct {
        let mut seen = HashSet::new();
        bindings.retain(|b| seen.insert(lookup(b, &distinct.table, &distinct.column).key()));
    }

    match &select.projection {
        Projection::Count => {
            return vec![Row::new(
                vec!["count".to_string()],
                vec![Value::BigInt(bindings.len() as i64)],
            )];
        }
        Projection::Min(column) | Projection::Max(column) => {
            let values = bindings
                .iter()
                .map(|b| lookup(b, &column.table, &column.column))
                .filter(|v| !v.is_null());
            let picked = if matches!(select.projection, Projection::Min(_)) {
                values.min_by(|a, b| a.sort_cmp(b))
            } else {
                values.max_by(|a, b| a.sort_cmp(b))
            };
            return vec![Row::new(
                vec!["value".to_string()],
                vec![picked.unwrap_or(Value::Null)],
            )];
        }
        _ => {}
    }

    let offset = usize::try_from(select.offset.unwrap_or(0)).unwrap_or(usize::MAX);
    let limit = select
        .limit
        .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
    bindings
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|b| match &select.projection {
            Projection::Columns(columns) => Row::new(
                columns.iter().map(|c| c.column.clone()).collect(),
                columns.iter().map(|c| lookup(&b, &c.table, &c.column)).collect(),
            ),
            _ => to_row(b.get(&select.alias).unwrap_or(&StoredRow::new())),
        })
        .collect()
}

fn lookup(binding: &Binding, alias: &str, column: &str) -> Value {
    binding
        .get(alias)
        .and_then(|row| row.get(column))
        .cloned()
        .unwrap_or(Value::Null)
}

fn value_of(binding: &Binding, expr: &Expr) -> Value {
    match expr {
        Expr::Column(c) => lookup(binding, &c.table, &c.column),
        Expr::Value(v) => v.clone(),
        _ => Value::Null,
    }
}

fn truthy(db: &Db, binding: &Binding, expr: &Expr) -> bool {
    match expr {
        Expr::And(list) => list.iter().all(|e| truthy(db, binding, e)),
        Expr::Or(list) => list.iter().any(|e| truthy(db, binding, e)),
        Expr::Not(inner) => !truthy(db, binding, inner),
        Expr::Binary { left, op, right } => {
            let l = value_of(binding, left);
            let r = value_of(binding, right);
            let op = match op {
                BinaryOp::Eq => FilterOp::Eq(r),
                BinaryOp::NotEq => FilterOp::NotEq(r),
                BinaryOp::Gt => FilterOp::Gt(r),
                BinaryOp::Gte => FilterOp::Gte(r),
                BinaryOp::Lt => FilterOp::Lt(r),
                BinaryOp::Lte => FilterOp::Lte(r),
            };
            op.matches(&l)
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let op = if *negated {
                FilterOp::NotIn(list.clone())
            } else {
                FilterOp::In(list.clone())
            };
            op.matches(&value_of(binding, expr))
        }
        Expr::IsNull { expr, negated } => value_of(binding, expr).is_null() != *negated,
        Expr::Like { expr, pattern } => FilterOp::Like(pattern.clone()).matches(&value_of(binding, expr)),
        Expr::InSubquery {
            expr,
            query,
            negated,
        } => {
            let values: Vec<Value> = select_rows(db, query)
                .iter()
                .filter_map(|row| row.get(0).cloned())
                .collect();
            let op = if *negated {
                FilterOp::NotIn(values)
            } else {
                FilterOp::In(values)
            };
            op.matches(&value_of(binding, expr))
        }
        Expr::Column(_) | Expr::Value(_) => value_of(binding, expr).as_bool().unwrap_or(false),
    }
}

// ============================================================================
// Runtime helpers
// ============================================================================

/// Drive `future` to completion on a fresh current-thread runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected an error, got {other:?}")),
    }
}

// ============================================================================
// Blog schema
// ============================================================================

/// Hook firings as `"<event> <Model>#<id>"`, in order.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().expect("lock poisoned").clone()
}

fn recorder(
    log: &EventLog,
) -> impl Fn(&mut HookContext<'_>) -> relmodel::Result<()> + Send + Sync + 'static {
    let log = Arc::clone(log);
    move |ctx: &mut HookContext<'_>| -> relmodel::Result<()> {
        log.lock().expect("lock poisoned").push(format!(
            "{} {}#{}",
            ctx.event.as_str(),
            ctx.record.model_name(),
            ctx.record.id()
        ));
        Ok(())
    }
}

fn recorded(model: ModelBuilder, log: &EventLog, hooks: &[HookEvent]) -> ModelBuilder {
    hooks.iter().fold(model, |model, event| {
        model.hook(*event, format!("record_{}", event.as_str()), recorder(log))
    })
}

/// Users (soft delete, STI) own posts (soft delete) which own comments;
/// images hang off users and posts polymorphically, and go with their
/// user; tags are standalone.
pub fn blog_schema(log: &EventLog) -> Arc<Schema> {
    let lifecycle = [
        HookEvent::BeforeSave,
        HookEvent::BeforeCreate,
        HookEvent::AfterCreate,
        HookEvent::AfterSave,
        HookEvent::AfterCreateCommit,
        HookEvent::BeforeDestroy,
        HookEvent::AfterDestroy,
        HookEvent::AfterDestroyCommit,
    ];
    let destroy = [HookEvent::BeforeDestroy, HookEvent::AfterDestroy];

    let user = ModelBuilder::new("User")
        .column("name", "text")
        .column("email", "text")
        .soft_delete()
        .timestamps()
        .sti_base()
        .association(Assoc::has_many("posts", "Post").dependent_destroy())
        .association(
            Assoc::has_many("allPosts", "Post")
                .foreign_key("userId")
                .without_default_scope(SOFT_DELETE_SCOPE),
        )
        .association(
            Assoc::has_many("localizedPosts", "Post")
                .foreign_key("userId")
                .where_passthrough("locale"),
        )
        .association(Assoc::has_many("comments", "Comment").through("posts"))
        .association(
            Assoc::has_many("localizedComments", "Comment")
                .through("localizedPosts")
                .source("comments"),
        )
        .association(
            Assoc::has_many("images", "Image")
                .foreign_key("imageableId")
                .polymorphic()
                .dependent_destroy(),
        );

    let post = ModelBuilder::new("Post")
        .column("userId", "bigint")
        .column("title", "text")
        .column("locale", "text")
        .column("published", "boolean")
        .column("rating", "double")
        .column("metadata", "json")
        .soft_delete()
        .timestamps()
        .scope(ScopeDescriptor::named(
            "published",
            vec![Filter::eq("published", true)],
        ))
        .association(Assoc::belongs_to("user", "User"))
        .association(Assoc::has_many("comments", "Comment").dependent_destroy())
        .association(
            Assoc::has_many("images", "Image")
                .foreign_key("imageableId")
                .polymorphic(),
        );

    let comment = ModelBuilder::new("Comment")
        .column("postId", "bigint")
        .column("body", "text")
        .association(Assoc::belongs_to("post", "Post"))
        .hook(HookEvent::BeforeDestroy, "keep_pinned", |ctx| {
            if ctx.record.get("body").and_then(Value::as_str) == Some("pinned") {
                ctx.prevent_deletion();
            }
            Ok(())
        });

    SchemaBuilder::new()
        .model(recorded(user, log, &lifecycle))
        .model(
            ModelBuilder::new("Admin")
                .sti_parent("User")
                .column("level", "integer"),
        )
        .model(recorded(post, log, &destroy))
        .model(recorded(comment, log, &destroy))
        .model(recorded(
            ModelBuilder::new("Image")
                .column("imageableId", "bigint")
                .column("imageableType", "text")
                .column("url", "text")
                .association(Assoc::belongs_to_polymorphic("imageable", ["User", "Post"])),
            log,
            &destroy,
        ))
        .model(ModelBuilder::new("Tag").column("name", "text"))
        .build()
        .expect("blog schema builds")
}

/// Render every select the executor saw, in order.
pub fn selects(executor: &MemoryExecutor) -> Vec<String> {
    executor
        .statements()
        .iter()
        .filter(|s| matches!(s, Statement::Select(_)))
        .map(ToString::to_string)
        .collect()
}
