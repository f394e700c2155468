//! Sessions for relmodel.
//!
//! `relmodel-session` is the **execution layer**. A [`Session`] ties a
//! validated [`Schema`] to an [`Executor`] and runs everything that needs the
//! store:
//!
//! - **Query runner**: compiles plans and hydrates rows into [`Record`]s.
//! - **Preload hydrator**: batch-loads association trees, one query per
//!   association edge and owning type per level.
//! - **Persistence coordinator**: create/update/destroy with hook ordering,
//!   timestamps, cascades and soft deletes.
//! - **Transactions**: explicit [`Transaction`] handles with deferred
//!   commit hooks.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(schema, executor);
//!
//! let user = session.create(&cx, "User", [("name", "ada")], None).await?;
//! let post = session
//!     .create_association(&cx, &mut user, "posts", [("title", "hi")], None)
//!     .await?;
//!
//! let users = session
//!     .query("User")
//!     .filter(Filter::eq("name", "ada"))
//!     .preload("posts.comments")
//!     .all(&cx)
//!     .await?;
//! ```

pub mod hydrate;
pub mod persist;
pub mod query;
pub mod transaction;

pub use persist::invalid;
pub use query::Query;
pub use transaction::Transaction;

use asupersync::{Cx, Outcome};
use relmodel_core::{
    AttributeMarshaller, DefaultMarshaller, Error, Executor, ModelDef, PersistenceErrorKind,
    QueryResult, Record, Result, Row, Schema, Statement, TransactionError, TransactionErrorKind,
    TxnHandle, Value, try_outcome,
};
use relmodel_query::QueryPlan;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maintain `createdAt` / `updatedAt` on models that declare them.
    pub timestamps: bool,
    /// Run `destroy` / `undestroy` cascades in a transaction of their own
    /// when the caller did not pass one.
    pub transactional_destroy: bool,
    /// Deepest preload tree `load` accepts.
    pub max_preload_depth: usize,
    /// Log every statement at debug level.
    pub log_statements: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timestamps: true,
            transactional_destroy: true,
            max_preload_depth: 16,
            log_statements: false,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    #[must_use]
    pub fn transactional_destroy(mut self, enabled: bool) -> Self {
        self.transactional_destroy = enabled;
        self
    }

    #[must_use]
    pub fn max_preload_depth(mut self, depth: usize) -> Self {
        self.max_preload_depth = depth;
        self
    }

    #[must_use]
    pub fn log_statements(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }
}

// ============================================================================
// Session
// ============================================================================

/// Schema + executor + marshaller.
///
/// A session holds no per-record state; every operation takes the records
/// it works on explicitly, and the schema is shared read-only.
pub struct Session<E: Executor> {
    schema: Arc<Schema>,
    executor: E,
    marshaller: Arc<dyn AttributeMarshaller>,
    config: SessionConfig,
}

impl<E: Executor> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("models", &self.schema.models().count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: Executor> Session<E> {
    /// Create a session with the default configuration and marshaller.
    pub fn new(schema: Arc<Schema>, executor: E) -> Self {
        Self::with_config(schema, executor, SessionConfig::default())
    }

    pub fn with_config(schema: Arc<Schema>, executor: E, config: SessionConfig) -> Self {
        Self {
            schema,
            executor,
            marshaller: Arc::new(DefaultMarshaller),
            config,
        }
    }

    /// Replace the attribute marshaller.
    #[must_use]
    pub fn with_marshaller(mut self, marshaller: Arc<dyn AttributeMarshaller>) -> Self {
        self.marshaller = marshaller;
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn model(&self, name: &str) -> Result<&Arc<ModelDef>> {
        self.schema.model(name)
    }

    // ========================================================================
    // Query Entry Points
    // ========================================================================

    /// A query over every visible record of `model`.
    pub fn query(&self, model: &str) -> Query<'_, E> {
        Query::new(self, QueryPlan::new(model))
    }

    /// Wrap an existing plan.
    pub fn plan(&self, plan: QueryPlan) -> Query<'_, E> {
        Query::new(self, plan)
    }

    /// A query matching exactly `record`'s row.
    pub fn query_for(&self, record: &Record) -> Result<Query<'_, E>> {
        let model = record.model();
        if record.is_new_record() {
            return Err(Error::persistence(
                PersistenceErrorKind::Unpersisted,
                model.name.as_str(),
                "record has not been saved",
            ));
        }
        let plan =
            QueryPlan::new(model.name.as_str()).where_eq(&model.primary_key, record.id().clone());
        Ok(Query::new(self, plan))
    }

    /// A query over the records `record` reaches through `association`.
    pub fn associated(&self, record: &Record, association: &str) -> Result<Query<'_, E>> {
        self.associated_with(record, association, Vec::new())
    }

    /// Like [`associated`](Self::associated), with filters on the
    /// association's targets that also satisfy `Required` association
    /// filters.
    pub fn associated_with(
        &self,
        record: &Record,
        association: &str,
        filters: Vec<relmodel_core::Filter>,
    ) -> Result<Query<'_, E>> {
        let plan = query::associated_plan(&self.schema, record, association, filters)?;
        Ok(Query::new(self, plan))
    }

    /// Build an unsaved record.
    ///
    /// Attributes pass through the marshaller, and required BelongsTo
    /// foreign keys are checked before the record is returned.
    pub fn build<I, K, V>(&self, model: &str, attributes: I) -> Result<Record>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.build_with(model, attributes, &[])
    }

    /// Build an unsaved record whose BelongsTo associations point at
    /// `associated`.
    pub fn build_with<I, K, V>(
        &self,
        model: &str,
        attributes: I,
        associated: &[(&str, &Record)],
    ) -> Result<Record>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let model = self.schema.model(model)?;
        let attributes = self.marshal_attributes(model, attributes)?;
        Record::build_with(model, attributes, associated)
    }

    /// Normalize caller attributes the way values read back from the store
    /// are normalized.
    pub(crate) fn marshal_attributes<I, K, V>(
        &self,
        model: &ModelDef,
        attributes: I,
    ) -> Result<Vec<(String, Value)>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        attributes
            .into_iter()
            .map(|(column, value)| {
                let column = column.as_ref();
                let value = self.marshaller.decode(model, column, value.into())?;
                Ok((column.to_string(), value))
            })
            .collect()
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Open a transaction.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn begin(&self, cx: &Cx) -> Outcome<Transaction, Error> {
        let handle = try_outcome!(self.executor.begin(cx).await);
        tracing::debug!(txn = handle.id(), "Transaction opened");
        Outcome::Ok(Transaction::new(handle))
    }

    /// Commit a transaction, then fire its deferred commit hooks.
    #[tracing::instrument(level = "debug", skip(self, cx, txn), fields(txn = txn.handle().id()))]
    pub async fn commit(&self, cx: &Cx, txn: Transaction) -> Outcome<(), Error> {
        if !txn.finalize() {
            return Outcome::Err(transaction_finalized("commit on a finished transaction"));
        }
        try_outcome!(self.executor.commit(cx, txn.handle()).await);
        tracing::debug!(
            deferred_hooks = txn.pending_hooks(),
            "Transaction committed"
        );
        match txn.run_deferred() {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Roll back a transaction, discarding its deferred commit hooks.
    #[tracing::instrument(level = "debug", skip(self, cx, txn), fields(txn = txn.handle().id()))]
    pub async fn rollback(&self, cx: &Cx, txn: Transaction) -> Outcome<(), Error> {
        if !txn.finalize() {
            return Outcome::Err(transaction_finalized("rollback on a finished transaction"));
        }
        let dropped = txn.discard_deferred();
        try_outcome!(self.executor.rollback(cx, txn.handle()).await);
        tracing::debug!(dropped_hooks = dropped, "Transaction rolled back");
        Outcome::Ok(())
    }

    /// Run `f` inside a new transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back on anything else and
    /// returns `f`'s outcome unchanged.
    ///
    /// ```ignore
    /// session.transaction(&cx, |txn| async move {
    ///     session.create(&cx, "User", [("name", "ada")], Some(&txn)).await
    /// }).await?;
    /// ```
    pub async fn transaction<T, F, Fut>(&self, cx: &Cx, f: F) -> Outcome<T, Error>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        let txn = try_outcome!(self.begin(cx).await);
        let outcome = f(txn.clone()).await;
        self.finish(cx, Some(txn), outcome).await
    }

    /// Settle a transaction the session opened on the caller's behalf.
    pub(crate) async fn finish<T>(
        &self,
        cx: &Cx,
        txn: Option<Transaction>,
        outcome: Outcome<T, Error>,
    ) -> Outcome<T, Error> {
        let Some(txn) = txn else {
            return outcome;
        };
        if txn.is_finalized() {
            return outcome;
        }
        match outcome {
            Outcome::Ok(value) => {
                try_outcome!(self.commit(cx, txn).await);
                Outcome::Ok(value)
            }
            other => {
                if let Outcome::Err(e) = self.rollback(cx, txn).await {
                    tracing::warn!(error = %e, "Rollback failed");
                }
                other
            }
        }
    }

    /// Open a transaction unless the caller supplied one.
    pub(crate) async fn auto_transaction(
        &self,
        cx: &Cx,
        txn: Option<&Transaction>,
    ) -> Outcome<Option<Transaction>, Error> {
        if txn.is_some() || !self.config.transactional_destroy {
            return Outcome::Ok(None);
        }
        let opened = try_outcome!(self.begin(cx).await);
        Outcome::Ok(Some(opened))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run one statement through the executor.
    pub(crate) async fn execute(
        &self,
        cx: &Cx,
        stmt: Statement,
        txn: Option<TxnHandle>,
    ) -> Outcome<QueryResult, Error> {
        if self.config.log_statements {
            tracing::debug!(statement = %stmt, txn = ?txn.map(TxnHandle::id), "Executing");
        } else {
            tracing::trace!(statement = %stmt, "Executing");
        }
        match self.executor.execute(cx, &stmt, txn).await {
            Outcome::Err(e) => {
                tracing::debug!(error = %e, table = stmt.table(), "Statement failed");
                Outcome::Err(e)
            }
            other => other,
        }
    }

    /// Decode a row read through `model` into a record of its concrete
    /// (STI-resolved) model.
    pub(crate) fn hydrate_row(&self, model: &Arc<ModelDef>, row: &Row) -> Result<Record> {
        let concrete = match model.sti_column.as_deref() {
            Some(column) => self
                .schema
                .concrete_model(model, row.get_by_name(column).and_then(Value::as_str)),
            None => Arc::clone(model),
        };
        let mut values = Vec::with_capacity(concrete.columns().len());
        for column in concrete.columns() {
            let raw = row.get_by_name(&column.name).cloned().unwrap_or(Value::Null);
            values.push(self.marshaller.decode(&concrete, &column.name, raw)?);
        }
        Ok(Record::hydrate(&concrete, values))
    }

    /// Encode an attribute for the executor.
    pub(crate) fn encode(&self, model: &ModelDef, column: &str, value: Value) -> Result<Value> {
        self.marshaller.encode(model, column, value)
    }

    pub(crate) fn decode(&self, model: &ModelDef, column: &str, value: Value) -> Result<Value> {
        self.marshaller.decode(model, column, value)
    }
}

/// Current time as a timestamp value.
pub(crate) fn now() -> Value {
    let micros = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX));
    Value::Timestamp(micros)
}

fn transaction_finalized(message: impl Into<String>) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::Finalized,
        message: message.into(),
    })
}
