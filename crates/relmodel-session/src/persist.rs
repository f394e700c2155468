//! Persistence: create, update, destroy and friends.
//!
//! Hook order per operation:
//!
//! | operation | sequence |
//! |-----------|----------|
//! | create    | `before_save`, `before_create`, INSERT, `after_create`, `after_save` |
//! | update    | `before_save`, `before_update`, UPDATE, `after_update`, `after_save` |
//! | destroy   | dependents, `before_destroy`, DELETE / soft delete, `after_destroy` |
//!
//! `after_*_commit` hooks are queued on the transaction when there is one
//! and fire immediately otherwise.

use crate::query::{Query, associated_plan};
use crate::transaction::commit_hook;
use crate::{BoxFuture, Session, Transaction, now};
use asupersync::{Cx, Outcome};
use relmodel_core::record::owner_key;
use relmodel_core::{
    AssociationKind, AssociationWhereValue, DeleteStatement, Error, Executor, Expr, Filter,
    FilterOp, HookEvent, InsertStatement, ModelDef, PersistenceErrorKind, Record, Result,
    SOFT_DELETE_SCOPE, TxnHandle, UpdateStatement, ValidationError, Value, run_hooks, try_outcome,
    try_result,
};
use relmodel_query::QueryPlan;
use std::sync::Arc;

fn handle(txn: Option<&Transaction>) -> Option<TxnHandle> {
    txn.map(Transaction::handle)
}

/// `table.pk = <persisted key>` for DML on one row.
fn row_filter(model: &ModelDef, record: &Record) -> Expr {
    let key = record
        .persisted_value(&model.primary_key)
        .cloned()
        .unwrap_or(Value::Null);
    Expr::filter(&model.table, &Filter::eq(model.primary_key.as_str(), key))
}

fn unpersisted(model: &ModelDef, action: &str) -> Error {
    Error::persistence(
        PersistenceErrorKind::Unpersisted,
        model.name.as_str(),
        format!("cannot {} a record that was never saved", action),
    )
}

impl<E: Executor> Session<E> {
    /// Build and insert a record.
    pub async fn create<I, K, V>(
        &self,
        cx: &Cx,
        model: &str,
        attributes: I,
        txn: Option<&Transaction>,
    ) -> Outcome<Record, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut record = try_result!(self.build(model, attributes));
        try_outcome!(self.insert(cx, &mut record, txn).await);
        Outcome::Ok(record)
    }

    /// Insert a new record or write a persisted record's changes.
    pub async fn save(
        &self,
        cx: &Cx,
        record: &mut Record,
        txn: Option<&Transaction>,
    ) -> Outcome<(), Error> {
        if record.is_new_record() {
            self.insert(cx, record, txn).await
        } else {
            self.write_changes(cx, record, txn).await
        }
    }

    /// Assign `attributes` and save.
    pub async fn update<I, K, V>(
        &self,
        cx: &Cx,
        record: &mut Record,
        attributes: I,
        txn: Option<&Transaction>,
    ) -> Outcome<(), Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (column, value) in attributes {
            try_result!(record.set(column.as_ref(), value));
        }
        self.save(cx, record, txn).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %record.model_name()))]
    async fn insert(
        &self,
        cx: &Cx,
        record: &mut Record,
        txn: Option<&Transaction>,
    ) -> Outcome<(), Error> {
        let model = Arc::clone(record.model());
        try_result!(record.validate_belongs_to());
        try_result!(run_hooks(HookEvent::BeforeSave, record, handle(txn)));
        try_result!(run_hooks(HookEvent::BeforeCreate, record, handle(txn)));

        if self.config().timestamps {
            if let Some((created, updated)) = &model.timestamps {
                let stamp = now();
                if record.get(created).is_none_or(Value::is_null) {
                    try_result!(record.set(created, stamp.clone()));
                }
                try_result!(record.set(updated, stamp));
            }
        }
        if let Some(column) = &model.sti_column {
            if record.get(column).is_none_or(Value::is_null) {
                try_result!(record.set(column, model.name.as_str()));
            }
        }

        let mut values = Vec::new();
        for (column, value) in record.attributes() {
            if column == model.primary_key && value.is_null() {
                continue;
            }
            values.push((
                column.to_string(),
                try_result!(self.encode(&model, column, value.clone())),
            ));
        }
        let stmt = InsertStatement {
            table: model.table.clone(),
            values,
        };
        let result = try_outcome!(self.execute(cx, stmt.into(), handle(txn)).await);
        let Some(row) = result.first() else {
            return Outcome::Err(Error::persistence(
                PersistenceErrorKind::RecordNotFound,
                model.name.as_str(),
                "insert returned no row",
            ));
        };
        let mut stored = Vec::with_capacity(model.columns().len());
        for column in model.columns() {
            let value = match row.get_by_name(&column.name) {
                Some(raw) => try_result!(self.decode(&model, &column.name, raw.clone())),
                None => record.get(&column.name).cloned().unwrap_or(Value::Null),
            };
            stored.push(value);
        }
        record.refresh(stored);
        tracing::debug!(id = %record.id(), "Inserted record");

        try_result!(run_hooks(HookEvent::AfterCreate, record, handle(txn)));
        try_result!(run_hooks(HookEvent::AfterSave, record, handle(txn)));
        try_result!(commit_hook(HookEvent::AfterCreateCommit, record, txn));
        try_result!(commit_hook(HookEvent::AfterSaveCommit, record, txn));
        Outcome::Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %record.model_name(), id = %record.id()))]
    async fn write_changes(
        &self,
        cx: &Cx,
        record: &mut Record,
        txn: Option<&Transaction>,
    ) -> Outcome<(), Error> {
        let model = Arc::clone(record.model());
        if record.is_destroyed() {
            return Outcome::Err(Error::persistence(
                PersistenceErrorKind::Unpersisted,
                model.name.as_str(),
                "cannot update a destroyed record",
            ));
        }
        if !record.is_dirty() {
            tracing::trace!("Nothing to update");
            return Outcome::Ok(());
        }
        try_result!(record.validate_belongs_to());
        try_result!(run_hooks(HookEvent::BeforeSave, record, handle(txn)));
        try_result!(run_hooks(HookEvent::BeforeUpdate, record, handle(txn)));

        if self.config().timestamps {
            if let Some((_, updated)) = &model.timestamps {
                try_result!(record.set(updated, now()));
            }
        }

        let mut assignments = Vec::new();
        for (column, _, current) in record.changes() {
            assignments.push((
                column.to_string(),
                try_result!(self.encode(&model, column, current.clone())),
            ));
        }
        let stmt = UpdateStatement {
            table: model.table.clone(),
            assignments,
            filter: row_filter(&model, record),
        };
        try_outcome!(self.execute(cx, stmt.into(), handle(txn)).await);
        record.mark_persisted();

        try_result!(run_hooks(HookEvent::AfterUpdate, record, handle(txn)));
        try_result!(run_hooks(HookEvent::AfterSave, record, handle(txn)));
        try_result!(commit_hook(HookEvent::AfterUpdateCommit, record, txn));
        try_result!(commit_hook(HookEvent::AfterSaveCommit, record, txn));
        Outcome::Ok(())
    }

    // ========================================================================
    // Destroy
    // ========================================================================

    /// Destroy a record and its `dependent: Destroy` associations.
    ///
    /// Soft-delete models get their deleted timestamp set; everything else
    /// is deleted. Returns `false` when a `before_destroy` hook prevented
    /// the deletion.
    pub async fn destroy(
        &self,
        cx: &Cx,
        record: &mut Record,
        txn: Option<&Transaction>,
    ) -> Outcome<bool, Error> {
        self.destroy_with(cx, record, txn, false).await
    }

    /// Like [`destroy`](Self::destroy), but deletes soft-delete rows too,
    /// and reaches dependents that were already soft-deleted.
    pub async fn really_destroy(
        &self,
        cx: &Cx,
        record: &mut Record,
        txn: Option<&Transaction>,
    ) -> Outcome<bool, Error> {
        self.destroy_with(cx, record, txn, true).await
    }

    async fn destroy_with(
        &self,
        cx: &Cx,
        record: &mut Record,
        txn: Option<&Transaction>,
        hard: bool,
    ) -> Outcome<bool, Error> {
        if record.is_new_record() {
            return Outcome::Err(unpersisted(record.model(), "destroy"));
        }
        let opened = try_outcome!(self.auto_transaction(cx, txn).await);
        let active = txn.or(opened.as_ref());
        let outcome = self.destroy_inner(cx, record, active, hard).await;
        self.finish(cx, opened, outcome).await
    }

    fn destroy_inner<'a>(
        &'a self,
        cx: &'a Cx,
        record: &'a mut Record,
        txn: Option<&'a Transaction>,
        hard: bool,
    ) -> BoxFuture<'a, Outcome<bool, Error>> {
        Box::pin(async move {
            let model = Arc::clone(record.model());
            for assoc in model.associations.dependents() {
                let mut plan = try_result!(associated_plan(self.schema(), record, &assoc.name, Vec::new()))
                    .in_transaction(handle(txn));
                if hard {
                    plan = plan.remove_default_scope(SOFT_DELETE_SCOPE);
                }
                let mut children = try_outcome!(Query::new(self, plan).all(cx).await);
                tracing::debug!(
                    model = %model.name,
                    association = %assoc.name,
                    children = children.len(),
                    "Destroying dependents"
                );
                for child in &mut children {
                    try_outcome!(self.destroy_inner(cx, child, txn, hard).await);
                }
                record.unload(&assoc.name);
            }

            let prevented = try_result!(run_hooks(HookEvent::BeforeDestroy, record, handle(txn)));
            if prevented {
                tracing::debug!(model = %model.name, id = %record.id(), "Deletion prevented by hook");
                return Outcome::Ok(false);
            }

            match (&model.deleted_at, hard) {
                (Some(column), false) => {
                    let stamp = now();
                    let stmt = UpdateStatement {
                        table: model.table.clone(),
                        assignments: vec![(
                            column.clone(),
                            try_result!(self.encode(&model, column, stamp.clone())),
                        )],
                        filter: row_filter(&model, record),
                    };
                    try_outcome!(self.execute(cx, stmt.into(), handle(txn)).await);
                    try_result!(record.set(column, stamp));
                    record.mark_persisted();
                }
                _ => {
                    let stmt = DeleteStatement {
                        table: model.table.clone(),
                        filter: row_filter(&model, record),
                    };
                    try_outcome!(self.execute(cx, stmt.into(), handle(txn)).await);
                }
            }
            record.mark_destroyed();
            tracing::debug!(model = %model.name, id = %record.id(), hard, "Destroyed record");

            try_result!(run_hooks(HookEvent::AfterDestroy, record, handle(txn)));
            try_result!(commit_hook(HookEvent::AfterDestroyCommit, record, txn));
            Outcome::Ok(true)
        })
    }

    /// Clear a soft-deleted record's deleted timestamp, and its soft-deleted
    /// `dependent: Destroy` children's.
    pub async fn undestroy(
        &self,
        cx: &Cx,
        record: &mut Record,
        txn: Option<&Transaction>,
    ) -> Outcome<(), Error> {
        let model = Arc::clone(record.model());
        if !model.is_soft_delete() {
            return Outcome::Err(Error::persistence(
                PersistenceErrorKind::UndestroyNonSoftDelete,
                model.name.as_str(),
                format!("{} does not soft delete", model.name),
            ));
        }
        if record.is_new_record() {
            return Outcome::Err(unpersisted(&model, "undestroy"));
        }
        let opened = try_outcome!(self.auto_transaction(cx, txn).await);
        let active = txn.or(opened.as_ref());
        let outcome = self.undestroy_inner(cx, record, active).await;
        self.finish(cx, opened, outcome).await
    }

    fn undestroy_inner<'a>(
        &'a self,
        cx: &'a Cx,
        record: &'a mut Record,
        txn: Option<&'a Transaction>,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            let model = Arc::clone(record.model());
            let Some(column) = model.deleted_at.clone() else {
                return Outcome::Ok(());
            };

            let lookup = QueryPlan::new(model.name.as_str())
                .remove_default_scope(SOFT_DELETE_SCOPE)
                .where_eq(&model.primary_key, record.id().clone())
                .in_transaction(handle(txn));
            let found = try_outcome!(Query::new(self, lookup).exists(cx).await);
            if !found {
                return Outcome::Err(Error::persistence(
                    PersistenceErrorKind::RecordNotFound,
                    model.name.as_str(),
                    format!("no {} with {} = {}", model.name, model.primary_key, record.id()),
                ));
            }

            let stmt = UpdateStatement {
                table: model.table.clone(),
                assignments: vec![(column.clone(), Value::Null)],
                filter: row_filter(&model, record),
            };
            try_outcome!(self.execute(cx, stmt.into(), handle(txn)).await);
            try_result!(record.set(&column, Value::Null));
            record.mark_persisted();
            tracing::debug!(model = %model.name, id = %record.id(), "Undestroyed record");

            for assoc in model.associations.dependents() {
                let plan = try_result!(associated_plan(self.schema(), record, &assoc.name, Vec::new()));
                let target = try_result!(self.model(plan.model())).clone();
                let Some(child_column) = target.deleted_at.as_deref() else {
                    continue;
                };
                let plan = plan
                    .remove_default_scope(SOFT_DELETE_SCOPE)
                    .filter(Filter::is_not_null(child_column))
                    .in_transaction(handle(txn));
                let mut children = try_outcome!(Query::new(self, plan).all(cx).await);
                for child in &mut children {
                    try_outcome!(self.undestroy_inner(cx, child, txn).await);
                }
                record.unload(&assoc.name);
            }
            Outcome::Ok(())
        })
    }

    // ========================================================================
    // Reload / Find-Or-Create
    // ========================================================================

    /// Re-read a record's row, ignoring default scopes, and drop its loaded
    /// associations.
    pub async fn reload(
        &self,
        cx: &Cx,
        record: &mut Record,
        txn: Option<&Transaction>,
    ) -> Outcome<(), Error> {
        let model = Arc::clone(record.model());
        if record.is_new_record() {
            return Outcome::Err(Error::persistence(
                PersistenceErrorKind::ReloadUnpersisted,
                model.name.as_str(),
                "cannot reload a record that was never saved",
            ));
        }
        let plan = QueryPlan::new(model.name.as_str())
            .remove_all_default_scopes()
            .where_eq(&model.primary_key, record.id().clone())
            .in_transaction(handle(txn));
        let Some(fresh) = try_outcome!(Query::new(self, plan).first(cx).await) else {
            return Outcome::Err(Error::persistence(
                PersistenceErrorKind::RecordNotFound,
                model.name.as_str(),
                format!("no {} with {} = {}", model.name, model.primary_key, record.id()),
            ));
        };
        record.refresh(fresh.values().to_vec());
        record.unload_all();
        Outcome::Ok(())
    }

    /// Insert; if that hits a unique constraint, return the row that won.
    ///
    /// The violation surfaces only when the follow-up lookup by the same
    /// attributes finds nothing.
    pub async fn create_or_find_by<I, K, V>(
        &self,
        cx: &Cx,
        model: &str,
        attributes: I,
        txn: Option<&Transaction>,
    ) -> Outcome<Record, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let attributes: Vec<(String, Value)> = attributes
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.into()))
            .collect();
        match self.create(cx, model, attributes.clone(), txn).await {
            Outcome::Err(e) if e.is_unique_violation() => {
                tracing::warn!(model, error = %e, "Unique violation on create; looking up existing row");
                let filters = attributes
                    .into_iter()
                    .map(|(column, value)| Filter::eq(column, value))
                    .collect();
                let lookup = self.query(model).in_transaction(txn);
                match try_outcome!(lookup.find_by(cx, filters).await) {
                    Some(existing) => Outcome::Ok(existing),
                    None => Outcome::Err(e),
                }
            }
            other => other,
        }
    }

    /// Look a record up by `attributes`, creating it when absent.
    pub async fn find_or_create_by<I, K, V>(
        &self,
        cx: &Cx,
        model: &str,
        attributes: I,
        txn: Option<&Transaction>,
    ) -> Outcome<Record, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let attributes: Vec<(String, Value)> = attributes
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.into()))
            .collect();
        let filters = attributes
            .iter()
            .map(|(column, value)| Filter::eq(column.as_str(), value.clone()))
            .collect();
        let lookup = self.query(model).in_transaction(txn);
        if let Some(existing) = try_outcome!(lookup.find_by(cx, filters).await) {
            return Outcome::Ok(existing);
        }
        self.create(cx, model, attributes, txn).await
    }

    // ========================================================================
    // Association Writes
    // ========================================================================

    /// Create a record through one of `owner`'s associations.
    ///
    /// HasOne/HasMany targets get the owner's key (and type, when
    /// polymorphic) plus the association's equality filters; the owner's
    /// slot is unloaded. A BelongsTo target is created first and then
    /// assigned to the owner, which is saved.
    pub async fn create_association<I, K, V>(
        &self,
        cx: &Cx,
        owner: &mut Record,
        association: &str,
        attributes: I,
        txn: Option<&Transaction>,
    ) -> Outcome<Record, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let model = Arc::clone(owner.model());
        if owner.is_new_record() {
            return Outcome::Err(unpersisted(&model, "create an association of"));
        }
        let assoc = Arc::clone(try_result!(model.association(association)));
        if assoc.is_through() || assoc.is_polymorphic_belongs_to() {
            return Outcome::Err(Error::Validation(ValidationError {
                model: model.name.clone(),
                field: Some(association.to_string()),
                message: format!(
                    "cannot create records through '{}'; create them on the concrete association",
                    association
                ),
            }));
        }
        let target = Arc::clone(try_result!(self.model(try_result!(assoc.target_model()))));
        // The foreign key is filled from the owner below, so the required
        // BelongsTo check waits for the insert.
        let attributes = try_result!(self.marshal_attributes(&target, attributes));
        let mut record = Record::new(&target);
        try_result!(record.assign_attributes(attributes));

        if assoc.kind == AssociationKind::BelongsTo {
            try_outcome!(self.insert(cx, &mut record, txn).await);
            try_result!(owner.assign(association, &record));
            try_outcome!(self.save(cx, owner, txn).await);
            return Outcome::Ok(record);
        }

        try_result!(record.set(assoc.foreign_key_column(), owner_key(owner, &assoc).clone()));
        if let Some(discriminator) = assoc.discriminator_column() {
            try_result!(record.set(discriminator, model.polymorphic_name()));
        }
        for clause in &assoc.where_ {
            if let AssociationWhereValue::Filter(FilterOp::Eq(value)) = &clause.value {
                if record.get(&clause.column).is_none_or(Value::is_null) {
                    try_result!(record.set(&clause.column, value.clone()));
                }
            }
        }
        try_outcome!(self.insert(cx, &mut record, txn).await);
        owner.unload(association);
        Outcome::Ok(record)
    }
}

/// Record-level validation error, for hooks that reject a save.
pub fn invalid(record: &Record, field: Option<&str>, message: impl Into<String>) -> Result<()> {
    Err(Error::Validation(ValidationError {
        model: record.model_name().to_string(),
        field: field.map(str::to_string),
        message: message.into(),
    }))
}
