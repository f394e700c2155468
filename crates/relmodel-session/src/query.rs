//! Query execution.
//!
//! [`Query`] pairs a [`QueryPlan`] with the session that will run it. The
//! combinators mirror the plan's and stay persistent; the async terminal
//! methods compile the plan, execute it and hydrate the result.

use crate::{Session, Transaction};
use asupersync::{Cx, Outcome};
use relmodel_core::{
    Error, Executor, Filter, ModelDef, Order, PersistenceErrorKind, Record, Result,
    SelectStatement, Schema, Value, resolve_path, try_outcome, try_result,
};
use relmodel_query::{Anchor, JoinPath, PreloadTree, QueryPlan, Selection, compile};
use std::sync::Arc;

/// A plan bound to a session.
pub struct Query<'s, E: Executor> {
    session: &'s Session<E>,
    plan: QueryPlan,
}

impl<E: Executor> Clone for Query<'_, E> {
    fn clone(&self) -> Self {
        Self {
            session: self.session,
            plan: self.plan.clone(),
        }
    }
}

impl<E: Executor> std::fmt::Debug for Query<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query").field("plan", &self.plan).finish()
    }
}

impl<'s, E: Executor> Query<'s, E> {
    pub(crate) fn new(session: &'s Session<E>, plan: QueryPlan) -> Self {
        Self { session, plan }
    }

    fn map(&self, f: impl FnOnce(&QueryPlan) -> QueryPlan) -> Self {
        Self {
            session: self.session,
            plan: f(&self.plan),
        }
    }

    // ==================== Combinators ====================

    #[must_use]
    pub fn filter(&self, filter: Filter) -> Self {
        self.map(|p| p.filter(filter))
    }

    #[must_use]
    pub fn where_eq(&self, column: &str, value: impl Into<Value>) -> Self {
        self.map(|p| p.where_eq(column, value))
    }

    #[must_use]
    pub fn where_not(&self, filter: Filter) -> Self {
        self.map(|p| p.where_not(filter))
    }

    #[must_use]
    pub fn where_any(&self, filters: Vec<Filter>) -> Self {
        self.map(|p| p.where_any(filters))
    }

    #[must_use]
    pub fn order(&self, order: Order) -> Self {
        self.map(|p| p.order(order))
    }

    #[must_use]
    pub fn reorder(&self, orders: Vec<Order>) -> Self {
        self.map(|p| p.reorder(orders))
    }

    #[must_use]
    pub fn limit(&self, n: u64) -> Self {
        self.map(|p| p.limit(n))
    }

    #[must_use]
    pub fn offset(&self, n: u64) -> Self {
        self.map(|p| p.offset(n))
    }

    #[must_use]
    pub fn distinct(&self, column: impl Into<String>) -> Self {
        self.map(|p| p.distinct(column))
    }

    #[must_use]
    pub fn joins(&self, path: impl Into<JoinPath>) -> Self {
        self.map(|p| p.joins(path))
    }

    #[must_use]
    pub fn preload(&self, tree: impl Into<PreloadTree>) -> Self {
        self.map(|p| p.preload(tree))
    }

    #[must_use]
    pub fn passthrough(&self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.map(|p| p.passthrough(column, value))
    }

    #[must_use]
    pub fn scope(&self, name: impl Into<String>) -> Self {
        self.map(|p| p.scope(name))
    }

    #[must_use]
    pub fn remove_all_default_scopes(&self) -> Self {
        self.map(QueryPlan::remove_all_default_scopes)
    }

    #[must_use]
    pub fn remove_all_default_scopes_except_on_associations(&self) -> Self {
        self.map(QueryPlan::remove_all_default_scopes_except_on_associations)
    }

    #[must_use]
    pub fn remove_default_scope(&self, name: impl Into<String>) -> Self {
        self.map(|p| p.remove_default_scope(name))
    }

    #[must_use]
    pub fn in_transaction(&self, txn: Option<&Transaction>) -> Self {
        self.map(|p| p.in_transaction(txn.map(Transaction::handle)))
    }

    #[must_use]
    pub fn alias(&self, alias: impl Into<String>) -> Self {
        self.map(|p| p.alias(alias))
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn into_plan(self) -> QueryPlan {
        self.plan
    }

    /// The statement this query would run for `selection`.
    pub fn to_statement(&self, selection: &Selection) -> Result<SelectStatement> {
        compile(self.session.schema(), &self.plan, selection)
    }

    fn root_model(&self) -> Result<Arc<ModelDef>> {
        self.session.model(self.plan.model()).map(Arc::clone)
    }

    async fn run(&self, cx: &Cx, selection: &Selection) -> Outcome<relmodel_core::QueryResult, Error> {
        let stmt = try_result!(self.to_statement(selection));
        self.session
            .execute(cx, stmt.into(), self.plan.txn())
            .await
    }

    // ==================== Terminal Methods ====================

    /// Every matching record, with the plan's preloads hydrated.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(model = self.plan.model()))]
    pub async fn all(&self, cx: &Cx) -> Outcome<Vec<Record>, Error> {
        let model = try_result!(self.root_model());
        let result = try_outcome!(self.run(cx, &Selection::Records).await);
        let mut records = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            records.push(try_result!(self.session.hydrate_row(&model, row)));
        }
        tracing::debug!(rows = records.len(), "Query returned");
        try_outcome!(
            self.session
                .load_with_context(cx, &mut records, self.plan.preloads(), self.plan.context())
                .await
        );
        Outcome::Ok(records)
    }

    /// The first record by the plan's ordering, or by primary key when the
    /// plan has none.
    pub async fn first(&self, cx: &Cx) -> Outcome<Option<Record>, Error> {
        let model = try_result!(self.root_model());
        let mut plan = self.plan.limit(1);
        if plan.orders().is_empty() && plan.anchor().is_none() {
            plan = plan.order(Order::asc(model.primary_key.as_str()));
        }
        let records = try_outcome!(Query::new(self.session, plan).all(cx).await);
        Outcome::Ok(records.into_iter().next())
    }

    /// The last record: the plan's ordering reversed, or the highest
    /// primary key.
    pub async fn last(&self, cx: &Cx) -> Outcome<Option<Record>, Error> {
        let model = try_result!(self.root_model());
        let plan = if self.plan.orders().is_empty() {
            self.plan.order(Order::desc(model.primary_key.as_str()))
        } else {
            self.plan
                .reorder(self.plan.orders().iter().map(Order::reversed).collect())
        };
        let records = try_outcome!(Query::new(self.session, plan.limit(1)).all(cx).await);
        Outcome::Ok(records.into_iter().next())
    }

    /// The record with primary key `id`; `RecordNotFound` when no visible
    /// record has it.
    pub async fn find(&self, cx: &Cx, id: impl Into<Value>) -> Outcome<Record, Error> {
        let model = try_result!(self.root_model());
        let id = id.into();
        let plan = self.plan.where_eq(&model.primary_key, id.clone()).limit(1);
        let records = try_outcome!(Query::new(self.session, plan).all(cx).await);
        match records.into_iter().next() {
            Some(record) => Outcome::Ok(record),
            None => Outcome::Err(Error::persistence(
                PersistenceErrorKind::RecordNotFound,
                model.name.as_str(),
                format!("no {} with {} = {}", model.name, model.primary_key, id),
            )),
        }
    }

    /// The first record matching every filter.
    pub async fn find_by(&self, cx: &Cx, filters: Vec<Filter>) -> Outcome<Option<Record>, Error> {
        let plan = filters
            .into_iter()
            .fold(self.plan.clone(), |plan, filter| plan.filter(filter));
        Query::new(self.session, plan).first(cx).await
    }

    pub async fn count(&self, cx: &Cx) -> Outcome<u64, Error> {
        let result = try_outcome!(self.run(cx, &Selection::Count).await);
        let count = result
            .first()
            .and_then(|row| row.get(0))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Outcome::Ok(u64::try_from(count).unwrap_or(0))
    }

    /// One column of every matching row.
    pub async fn pluck(&self, cx: &Cx, column: &str) -> Outcome<Vec<Value>, Error> {
        let rows = try_outcome!(self.pluck_many(cx, &[column]).await);
        Outcome::Ok(rows.into_iter().filter_map(|r| r.into_iter().next()).collect())
    }

    /// Several columns of every matching row, in the order given.
    pub async fn pluck_many(&self, cx: &Cx, columns: &[&str]) -> Outcome<Vec<Vec<Value>>, Error> {
        let model = try_result!(self.root_model());
        let selection = Selection::Pluck(columns.iter().map(|c| (*c).to_string()).collect());
        let result = try_outcome!(self.run(cx, &selection).await);
        let mut out = Vec::with_capacity(result.rows.len());
        for row in result.rows {
            let mut values = Vec::with_capacity(columns.len());
            for (column, raw) in columns.iter().zip(row.into_values()) {
                values.push(try_result!(self.session.decode(&model, column, raw)));
            }
            out.push(values);
        }
        Outcome::Ok(out)
    }

    pub async fn min(&self, cx: &Cx, column: &str) -> Outcome<Option<Value>, Error> {
        self.aggregate(cx, column, Selection::Min(column.to_string()))
            .await
    }

    pub async fn max(&self, cx: &Cx, column: &str) -> Outcome<Option<Value>, Error> {
        self.aggregate(cx, column, Selection::Max(column.to_string()))
            .await
    }

    async fn aggregate(
        &self,
        cx: &Cx,
        column: &str,
        selection: Selection,
    ) -> Outcome<Option<Value>, Error> {
        let model = try_result!(self.root_model());
        let result = try_outcome!(self.run(cx, &selection).await);
        match result.first().and_then(|row| row.get(0)).cloned() {
            None | Some(Value::Null) => Outcome::Ok(None),
            Some(raw) => Outcome::Ok(Some(try_result!(self.session.decode(&model, column, raw)))),
        }
    }

    pub async fn exists(&self, cx: &Cx) -> Outcome<bool, Error> {
        let result = try_outcome!(self.run(cx, &Selection::Exists).await);
        Outcome::Ok(!result.rows.is_empty())
    }
}

/// The plan for the records `record` reaches through `association`.
///
/// The plan is rooted at the association's target model and anchored on
/// the owner's primary key. `filters` are routed over the association's
/// hops the way join filters are (and satisfy its `Required` filters). The
/// association's scope exemptions stay on its own edge. A polymorphic BelongsTo is
/// narrowed to the type the record currently points at.
pub(crate) fn associated_plan(
    schema: &Schema,
    record: &Record,
    association: &str,
    filters: Vec<Filter>,
) -> Result<QueryPlan> {
    let model = record.model();
    if record.is_new_record() {
        return Err(Error::persistence(
            PersistenceErrorKind::Unpersisted,
            model.name.as_str(),
            format!("cannot query '{}' of an unsaved record", association),
        ));
    }
    let path = resolve_path(schema, &model.name, association)?;
    let leaf = &path.leaf().association;
    let mut leaf_filters = filters;

    let target = if leaf.is_polymorphic_belongs_to() {
        let discriminator = leaf.discriminator_column().unwrap_or_default();
        let current = record
            .get(discriminator)
            .and_then(Value::as_str)
            .filter(|_| path.len() == 1);
        let target = current
            .or_else(|| leaf.target.candidates().first().map(String::as_str))
            .unwrap_or_default()
            .to_string();
        if path.len() == 1 {
            leaf_filters.push(Filter::eq(discriminator, target.as_str()));
        }
        target
    } else {
        leaf.target_model()?.to_string()
    };

    Ok(QueryPlan::new(target).anchored(Anchor {
        owner: model.name.clone(),
        key: record.id().clone(),
        association: association.to_string(),
        filters: leaf_filters,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use asupersync::runtime::RuntimeBuilder;
    use relmodel_core::{
        AssociationDescriptor as Assoc, ModelBuilder, SOFT_DELETE_SCOPE, SchemaBuilder, Statement,
    };

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new()
            .model(
                ModelBuilder::new("User")
                    .column("name", "text")
                    .association(Assoc::has_many("posts", "Post"))
                    .association(
                        Assoc::has_many("allPosts", "Post")
                            .foreign_key("userId")
                            .without_default_scope(SOFT_DELETE_SCOPE),
                    )
                    .association(
                        Assoc::has_many("allComments", "Comment")
                            .through("posts")
                            .source("comments")
                            .without_default_scope(SOFT_DELETE_SCOPE),
                    ),
            )
            .model(
                ModelBuilder::new("Post")
                    .column("userId", "bigint")
                    .column("title", "text")
                    .soft_delete()
                    .association(Assoc::belongs_to("user", "User"))
                    .association(Assoc::has_many("comments", "Comment")),
            )
            .model(
                ModelBuilder::new("Comment")
                    .column("postId", "bigint")
                    .column("body", "text")
                    .soft_delete()
                    .association(Assoc::belongs_to("post", "Post")),
            )
            .model(
                ModelBuilder::new("Image")
                    .column("imageableId", "bigint")
                    .column("imageableType", "text")
                    .association(Assoc::belongs_to_polymorphic("imageable", ["User", "Post"])),
            )
            .build()
            .unwrap()
    }

    fn last_select(executor: &ScriptedExecutor) -> String {
        match executor.executed().last() {
            Some(Statement::Select(select)) => select.to_string(),
            other => panic!("expected a select, got {other:?}"),
        }
    }

    #[test]
    fn first_and_last_order_by_primary_key() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let executor = ScriptedExecutor::default();
        let session = Session::new(schema(), executor.clone());

        rt.block_on(async {
            assert!(unwrap_outcome(session.query("User").first(&cx).await).is_none());
            assert_eq!(
                last_select(&executor),
                "SELECT users.* FROM \"users\" AS users ORDER BY users.\"id\" ASC LIMIT 1"
            );
            unwrap_outcome(
                session
                    .query("User")
                    .order(Order::asc("name"))
                    .last(&cx)
                    .await,
            );
            assert_eq!(
                last_select(&executor),
                "SELECT users.* FROM \"users\" AS users ORDER BY users.\"name\" DESC LIMIT 1"
            );
        });
    }

    #[test]
    fn find_reports_missing_record() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let session = Session::new(schema(), ScriptedExecutor::default());
        let outcome = rt.block_on(async { session.query("User").find(&cx, 42_i64).await });
        let Outcome::Err(err) = outcome else {
            panic!("expected an error");
        };
        assert_eq!(err.persistence_kind(), Some(PersistenceErrorKind::RecordNotFound));
    }

    #[test]
    fn count_reads_the_aggregate_row() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let executor = ScriptedExecutor::default()
            .with_rows("posts", vec![row(&[("count", Value::BigInt(3))])]);
        let session = Session::new(schema(), executor.clone());
        let count = rt.block_on(async { unwrap_outcome(session.query("Post").count(&cx).await) });
        assert_eq!(count, 3);
        assert_eq!(
            last_select(&executor),
            "SELECT COUNT(*) FROM \"posts\" AS posts WHERE posts.\"deletedAt\" IS NULL"
        );
    }

    #[test]
    fn associated_plan_anchors_on_owner() {
        let session = Session::new(schema(), ScriptedExecutor::default());
        let user = Arc::clone(session.model("User").unwrap());
        let record = Record::hydrate(&user, vec![Value::BigInt(7), Value::Text("ada".into())]);

        let stmt = session
            .associated(&record, "posts")
            .unwrap()
            .to_statement(&Selection::Records)
            .unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT posts.* FROM \"posts\" AS posts WHERE (posts.\"deletedAt\" IS NULL AND posts.\"id\" IN (\
             SELECT posts_1.\"id\" FROM \"users\" AS anchor INNER JOIN \"posts\" AS posts_1 ON \
             (anchor.\"id\" = posts_1.\"userId\" AND posts_1.\"deletedAt\" IS NULL) WHERE anchor.\"id\" = 7))"
        );

        let unscoped = session
            .associated(&record, "allPosts")
            .unwrap()
            .to_statement(&Selection::Records)
            .unwrap()
            .to_string();
        assert!(!unscoped.contains("deletedAt"));
    }

    #[test]
    fn through_scope_exemption_stays_on_its_edge() {
        let session = Session::new(schema(), ScriptedExecutor::default());
        let user = Arc::clone(session.model("User").unwrap());
        let record = Record::hydrate(&user, vec![Value::BigInt(7), Value::Text("ada".into())]);

        let sql = session
            .associated(&record, "allComments")
            .unwrap()
            .to_statement(&Selection::Records)
            .unwrap()
            .to_string();
        // Deleted posts still hide their comments; deleted comments show.
        assert!(sql.contains("posts_1.\"deletedAt\" IS NULL"), "{sql}");
        assert!(!sql.contains("comments_2.\"deletedAt\""), "{sql}");
        assert!(!sql.contains("comments.\"deletedAt\""), "{sql}");
    }

    #[test]
    fn associated_polymorphic_belongs_to_follows_the_discriminator() {
        let session = Session::new(schema(), ScriptedExecutor::default());
        let image = Arc::clone(session.model("Image").unwrap());
        let record = Record::hydrate(
            &image,
            vec![Value::BigInt(1), Value::BigInt(5), Value::Text("Post".into())],
        );
        let query = session.associated(&record, "imageable").unwrap();
        assert_eq!(query.plan().model(), "Post");
        let sql = query.to_statement(&Selection::Records).unwrap().to_string();
        assert!(sql.contains("anchor.\"imageableType\" = 'Post'"));
    }

    #[test]
    fn associated_requires_saved_owner() {
        let session = Session::new(schema(), ScriptedExecutor::default());
        let record = session.build("User", [("name", "ada")]).unwrap();
        let err = session.associated(&record, "posts").unwrap_err();
        assert_eq!(err.persistence_kind(), Some(PersistenceErrorKind::Unpersisted));
    }
}
