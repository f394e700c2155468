//! Model definitions and the schema registry.
//!
//! Every model is declared once with a [`ModelBuilder`] and registered on a
//! [`SchemaBuilder`]. [`SchemaBuilder::build`] validates the whole graph
//! (global names, single-table inheritance, foreign keys, association
//! filters, scope columns) and freezes it into an `Arc<Schema>` that is
//! shared read-only for the rest of the process.

use crate::association::{AssociationDescriptor, AssociationRegistry, AssociationTarget};
use crate::error::{AssociationErrorKind, DefinitionErrorKind, Error, Result};
use crate::filter::Filter;
use crate::foreign_key::resolve_foreign_key;
use crate::hooks::{Hook, HookContext, HookEvent, HookRegistry};
use crate::naming::{NamingConfig, is_valid_identifier, pluralize};
use crate::scope::{SOFT_DELETE_SCOPE, STI_SCOPE, ScopeDescriptor, ScopeRegistry};
use heck::ToSnakeCase;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One column in a model's field-descriptor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// Database type name as reported by introspection (`bigint`, `json`, ...)
    pub db_type: String,
    /// Storage slot in [`Record`](crate::Record) attribute vectors
    pub slot: usize,
}

/// Single-table-inheritance metadata of a child model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StiInfo {
    pub parent: String,
    /// Root of the inheritance chain
    pub base: String,
}

/// Runtime description of one model.
#[derive(Debug, Clone)]
pub struct ModelDef {
    /// Global type name
    pub name: String,
    pub table: String,
    pub primary_key: String,
    columns: Vec<ColumnDef>,
    column_index: HashMap<String, usize>,
    /// Soft-delete timestamp column, when the model opts in
    pub deleted_at: Option<String>,
    /// `(created, updated)` timestamp columns, when the model opts in
    pub timestamps: Option<(String, String)>,
    /// STI discriminator column, for bases and children alike
    pub sti_column: Option<String>,
    pub sti: Option<StiInfo>,
    pub associations: AssociationRegistry,
    pub scopes: ScopeRegistry,
    pub hooks: HookRegistry,
}

impl ModelDef {
    /// Columns in slot order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.column_index.get(name).map(|&i| &self.columns[i])
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index.contains_key(name)
    }

    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.column_index.get(name).copied()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn is_soft_delete(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The name stored in polymorphic discriminator columns: the root of the
    /// STI chain, or the model's own name.
    pub fn polymorphic_name(&self) -> &str {
        self.sti.as_ref().map_or(self.name.as_str(), |sti| sti.base.as_str())
    }

    /// Look up an association, failing with `MissingAssociation`.
    pub fn association(&self, name: &str) -> Result<&Arc<AssociationDescriptor>> {
        self.associations.get(name).ok_or_else(|| {
            Error::association(
                AssociationErrorKind::MissingAssociation,
                self.name.as_str(),
                name,
                format!("{} has no association named '{}'", self.name, name),
            )
        })
    }
}

/// Declares one model.
#[derive(Debug)]
pub struct ModelBuilder {
    name: String,
    table: Option<String>,
    primary_key: Option<String>,
    columns: Vec<(String, String)>,
    soft_delete: bool,
    timestamps: bool,
    sti_base: bool,
    sti_parent: Option<String>,
    associations: Vec<AssociationDescriptor>,
    scopes: Vec<ScopeDescriptor>,
    hooks: Vec<Hook>,
}

impl ModelBuilder {
    /// Start a model with the given global name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            primary_key: None,
            columns: Vec::new(),
            soft_delete: false,
            timestamps: false,
            sti_base: false,
            sti_parent: None,
            associations: Vec::new(),
            scopes: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Table name; defaults to the pluralized snake_case model name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    pub fn column(mut self, name: impl Into<String>, db_type: impl Into<String>) -> Self {
        self.columns.push((name.into(), db_type.into()));
        self
    }

    /// Opt into soft delete; adds the deleted-at column if not declared.
    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    /// Maintain created/updated timestamps; adds both columns if not declared.
    pub fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    /// Root of a single-table-inheritance hierarchy; adds the discriminator
    /// column if not declared.
    pub fn sti_base(mut self) -> Self {
        self.sti_base = true;
        self
    }

    /// Child of `parent` in a single-table-inheritance hierarchy. Shares the
    /// parent's table, columns, associations, scopes and hooks.
    pub fn sti_parent(mut self, parent: impl Into<String>) -> Self {
        self.sti_parent = Some(parent.into());
        self
    }

    pub fn association(mut self, association: AssociationDescriptor) -> Self {
        self.associations.push(association);
        self
    }

    pub fn scope(mut self, scope: ScopeDescriptor) -> Self {
        self.scopes.push(scope);
        self
    }

    pub fn hook<F>(mut self, event: HookEvent, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&mut HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.push(Hook::new(event, name, callback));
        self
    }
}

/// Collects model definitions and validates them into a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    naming: NamingConfig,
    models: Vec<ModelBuilder>,
}

struct Draft {
    def: ModelDef,
    associations: Vec<AssociationDescriptor>,
    scopes: Vec<ScopeDescriptor>,
    hooks: Vec<Hook>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_naming(naming: NamingConfig) -> Self {
        Self {
            naming,
            models: Vec::new(),
        }
    }

    pub fn model(mut self, model: ModelBuilder) -> Self {
        self.models.push(model);
        self
    }

    /// Validate every definition and freeze the registry.
    #[tracing::instrument(level = "debug", skip(self), fields(models = self.models.len()))]
    pub fn build(self) -> Result<Arc<Schema>> {
        let SchemaBuilder { naming, models } = self;

        let mut builders: HashMap<String, ModelBuilder> = HashMap::new();
        let mut order = Vec::new();
        for builder in models {
            if builder.name.is_empty() || !is_valid_identifier(&builder.name) {
                return Err(Error::definition(
                    DefinitionErrorKind::MissingGlobalName,
                    if builder.name.is_empty() {
                        "<anonymous>"
                    } else {
                        builder.name.as_str()
                    },
                    None,
                    "every model needs a global name that is a valid identifier",
                ));
            }
            let mut seen = HashSet::new();
            for assoc in &builder.associations {
                if !seen.insert(assoc.name.as_str()) {
                    return Err(Error::definition(
                        DefinitionErrorKind::DuplicateAssociation,
                        builder.name.as_str(),
                        Some(&assoc.name),
                        "association declared twice",
                    ));
                }
            }
            if builders.contains_key(&builder.name) {
                return Err(Error::definition(
                    DefinitionErrorKind::DuplicateModel,
                    builder.name.as_str(),
                    None,
                    "a model with this global name is already registered",
                ));
            }
            order.push(builder.name.clone());
            builders.insert(builder.name.clone(), builder);
        }

        let mut drafts: HashMap<String, Draft> = HashMap::new();
        for name in &order {
            draft_model(name, &builders, &mut drafts, &naming, &mut Vec::new())?;
        }

        add_builtin_scopes(&order, &mut drafts);

        let lookup_defs: HashMap<&str, &ModelDef> = drafts
            .iter()
            .map(|(name, draft)| (name.as_str(), &draft.def))
            .collect();
        let mut resolved: HashMap<String, Vec<AssociationDescriptor>> = HashMap::new();
        for name in &order {
            let draft = &drafts[name];
            let owner = &draft.def;
            for scope in &draft.scopes {
                for filter in scope.filters.iter().chain(&scope.filters_not) {
                    require_column(owner, &filter.column, None)?;
                }
            }
            let mut associations = draft.associations.clone();
            for assoc in &mut associations {
                validate_association(owner, assoc, &lookup_defs)?;
                resolve_foreign_key(owner, assoc, |n| lookup_defs.get(n).copied(), &naming)?;
            }
            resolved.insert(name.clone(), associations);
        }

        let mut schema_models = HashMap::new();
        for name in &order {
            if let Some(mut draft) = drafts.remove(name) {
                draft.def.associations =
                    AssociationRegistry::from_descriptors(resolved.remove(name).unwrap_or_default());
                draft.def.scopes = ScopeRegistry::from_scopes(draft.scopes);
                draft.def.hooks = HookRegistry::from_hooks(draft.hooks);
                tracing::trace!(
                    model = %name,
                    table = %draft.def.table,
                    associations = draft.def.associations.len(),
                    "Registered model"
                );
                schema_models.insert(name.clone(), Arc::new(draft.def));
            }
        }

        tracing::debug!(models = schema_models.len(), "Schema built");
        Ok(Arc::new(Schema {
            models: schema_models,
            order,
            naming,
        }))
    }
}

fn draft_model(
    name: &str,
    builders: &HashMap<String, ModelBuilder>,
    drafts: &mut HashMap<String, Draft>,
    naming: &NamingConfig,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if drafts.contains_key(name) {
        return Ok(());
    }
    let Some(builder) = builders.get(name) else {
        return Err(Error::definition(
            DefinitionErrorKind::UnknownModel,
            name,
            None,
            "model is not registered",
        ));
    };
    if visiting.iter().any(|v| v == name) {
        return Err(Error::definition(
            DefinitionErrorKind::InvalidStiParent,
            name,
            None,
            "single-table inheritance chain is cyclic",
        ));
    }

    let draft = if let Some(parent_name) = &builder.sti_parent {
        if !builders.contains_key(parent_name) {
            return Err(Error::definition(
                DefinitionErrorKind::InvalidStiParent,
                name,
                None,
                format!("STI parent '{}' is not registered", parent_name),
            ));
        }
        visiting.push(name.to_string());
        draft_model(parent_name, builders, drafts, naming, visiting)?;
        visiting.pop();
        let parent = &drafts[parent_name];
        if parent.def.sti_column.is_none() {
            return Err(Error::definition(
                DefinitionErrorKind::InvalidStiParent,
                name,
                None,
                format!(
                    "STI parent '{}' does not declare an inheritance column",
                    parent_name
                ),
            ));
        }
        if builder
            .table
            .as_ref()
            .is_some_and(|table| *table != parent.def.table)
        {
            return Err(Error::definition(
                DefinitionErrorKind::InvalidStiParent,
                name,
                None,
                "an STI child must share its parent's table",
            ));
        }
        child_draft(builder, parent)
    } else {
        root_draft(builder, naming)
    };
    drafts.insert(name.to_string(), draft);
    Ok(())
}

fn root_draft(builder: &ModelBuilder, naming: &NamingConfig) -> Draft {
    let table = builder
        .table
        .clone()
        .unwrap_or_else(|| pluralize(&builder.name.to_snake_case()));
    let primary_key = builder
        .primary_key
        .clone()
        .unwrap_or_else(|| naming.primary_key.clone());

    let mut columns = builder.columns.clone();
    if !columns.iter().any(|(c, _)| *c == primary_key) {
        columns.insert(0, (primary_key.clone(), "bigint".to_string()));
    }
    let deleted_at = builder.soft_delete.then(|| naming.deleted_at.clone());
    if let Some(col) = &deleted_at {
        push_missing(&mut columns, col, "timestamp");
    }
    let timestamps = builder
        .timestamps
        .then(|| (naming.created_at.clone(), naming.updated_at.clone()));
    if let Some((created, updated)) = &timestamps {
        push_missing(&mut columns, created, "timestamp");
        push_missing(&mut columns, updated, "timestamp");
    }
    let sti_column = builder.sti_base.then(|| naming.sti_column.clone());
    if let Some(col) = &sti_column {
        push_missing(&mut columns, col, "text");
    }

    Draft {
        def: model_def(
            builder.name.clone(),
            table,
            primary_key,
            &columns,
            deleted_at,
            timestamps,
            sti_column,
            None,
        ),
        associations: builder.associations.clone(),
        scopes: builder.scopes.clone(),
        hooks: builder.hooks.clone(),
    }
}

fn child_draft(builder: &ModelBuilder, parent: &Draft) -> Draft {
    let mut columns: Vec<(String, String)> = parent
        .def
        .columns
        .iter()
        .map(|c| (c.name.clone(), c.db_type.clone()))
        .collect();
    for (name, db_type) in &builder.columns {
        push_missing(&mut columns, name, db_type);
    }

    let mut associations: Vec<AssociationDescriptor> = parent
        .associations
        .iter()
        .filter(|a| !builder.associations.iter().any(|own| own.name == a.name))
        .cloned()
        .collect();
    associations.extend(builder.associations.iter().cloned());

    let mut scopes: Vec<ScopeDescriptor> = parent
        .scopes
        .iter()
        .filter(|s| s.name != STI_SCOPE && !builder.scopes.iter().any(|own| own.name == s.name))
        .cloned()
        .collect();
    scopes.extend(builder.scopes.iter().cloned());

    let mut hooks = parent.hooks.clone();
    hooks.extend(builder.hooks.iter().cloned());

    let base = parent
        .def
        .sti
        .as_ref()
        .map_or_else(|| parent.def.name.clone(), |sti| sti.base.clone());
    let deleted_at = parent.def.deleted_at.clone();
    let timestamps = parent.def.timestamps.clone();

    Draft {
        def: model_def(
            builder.name.clone(),
            parent.def.table.clone(),
            parent.def.primary_key.clone(),
            &columns,
            deleted_at,
            timestamps,
            parent.def.sti_column.clone(),
            Some(StiInfo {
                parent: parent.def.name.clone(),
                base,
            }),
        ),
        associations,
        scopes,
        hooks,
    }
}

#[allow(clippy::too_many_arguments)]
fn model_def(
    name: String,
    table: String,
    primary_key: String,
    columns: &[(String, String)],
    deleted_at: Option<String>,
    timestamps: Option<(String, String)>,
    sti_column: Option<String>,
    sti: Option<StiInfo>,
) -> ModelDef {
    let columns: Vec<ColumnDef> = columns
        .iter()
        .enumerate()
        .map(|(slot, (name, db_type))| ColumnDef {
            name: name.clone(),
            db_type: db_type.clone(),
            slot,
        })
        .collect();
    let column_index = columns
        .iter()
        .map(|c| (c.name.clone(), c.slot))
        .collect();
    ModelDef {
        name,
        table,
        primary_key,
        columns,
        column_index,
        deleted_at,
        timestamps,
        sti_column,
        sti,
        associations: AssociationRegistry::default(),
        scopes: ScopeRegistry::default(),
        hooks: HookRegistry::default(),
    }
}

fn push_missing(columns: &mut Vec<(String, String)>, name: &str, db_type: &str) {
    if !columns.iter().any(|(c, _)| c == name) {
        columns.push((name.to_string(), db_type.to_string()));
    }
}

/// Prepend the soft-delete scope and, for STI children, the discriminator
/// scope covering the child and its own descendants.
fn add_builtin_scopes(order: &[String], drafts: &mut HashMap<String, Draft>) {
    let parents: HashMap<String, String> = drafts
        .iter()
        .filter_map(|(name, d)| d.def.sti.as_ref().map(|sti| (name.clone(), sti.parent.clone())))
        .collect();

    for name in order {
        let mut family = vec![crate::value::Value::from(name.as_str())];
        for other in order {
            if other != name && is_descendant(other, name, &parents) {
                family.push(crate::value::Value::from(other.as_str()));
            }
        }
        let Some(draft) = drafts.get_mut(name) else {
            continue;
        };
        let mut builtins = Vec::new();
        if let Some(col) = &draft.def.deleted_at {
            if !draft.scopes.iter().any(|s| s.name == SOFT_DELETE_SCOPE) {
                builtins.push(ScopeDescriptor::default_scope(
                    SOFT_DELETE_SCOPE,
                    vec![Filter::is_null(col.as_str())],
                ));
            }
        }
        if let (Some(_), Some(col)) = (&draft.def.sti, &draft.def.sti_column) {
            let filter = if family.len() == 1 {
                Filter::eq(col.as_str(), name.as_str())
            } else {
                Filter::in_list(col.as_str(), family)
            };
            builtins.push(ScopeDescriptor::default_scope(STI_SCOPE, vec![filter]));
        }
        builtins.append(&mut draft.scopes);
        draft.scopes = builtins;
    }
}

fn is_descendant(model: &str, ancestor: &str, parents: &HashMap<String, String>) -> bool {
    let mut current = parents.get(model);
    let mut hops = 0;
    while let Some(parent) = current {
        if parent == ancestor {
            return true;
        }
        hops += 1;
        if hops > parents.len() {
            return false;
        }
        current = parents.get(parent);
    }
    false
}

fn require_column(model: &ModelDef, column: &str, association: Option<&str>) -> Result<()> {
    if model.has_column(column) {
        Ok(())
    } else {
        Err(Error::definition(
            DefinitionErrorKind::UnknownColumn,
            model.name.as_str(),
            association,
            format!("column '{}' does not exist on table '{}'", column, model.table),
        ))
    }
}

fn validate_association(
    owner: &ModelDef,
    assoc: &AssociationDescriptor,
    models: &HashMap<&str, &ModelDef>,
) -> Result<()> {
    for candidate in assoc.target.candidates() {
        if !models.contains_key(candidate.as_str()) {
            return Err(Error::definition(
                DefinitionErrorKind::UnknownModel,
                owner.name.as_str(),
                Some(&assoc.name),
                format!("association target '{}' is not registered", candidate),
            ));
        }
    }

    if assoc.dependent == crate::association::Dependent::Destroy && assoc.has_parameterized_where()
    {
        return Err(Error::definition(
            DefinitionErrorKind::DependentDestroyWithParameterizedWhere,
            owner.name.as_str(),
            Some(&assoc.name),
            "dependent destroy cannot be combined with a required or passthrough where clause",
        ));
    }

    if assoc.is_through() {
        return Ok(());
    }

    for self_where in assoc.self_where.iter().chain(&assoc.self_where_not) {
        require_column(owner, &self_where.owner_column, Some(&assoc.name))?;
    }

    // Filters on a polymorphic BelongsTo would have to hold on every
    // candidate table.
    let targets: Vec<&ModelDef> = match &assoc.target {
        AssociationTarget::Model(name) => models.get(name.as_str()).copied().into_iter().collect(),
        AssociationTarget::Polymorphic(names) => names
            .iter()
            .filter_map(|n| models.get(n.as_str()).copied())
            .collect(),
    };
    for target in targets {
        for w in assoc.where_.iter().chain(&assoc.where_not) {
            require_column(target, &w.column, Some(&assoc.name))?;
        }
        for self_where in assoc.self_where.iter().chain(&assoc.self_where_not) {
            require_column(target, &self_where.target_column, Some(&assoc.name))?;
        }
        if let Some(distinct) = &assoc.distinct {
            require_column(target, distinct, Some(&assoc.name))?;
        }
        for order in &assoc.order {
            require_column(target, &order.column, Some(&assoc.name))?;
        }
    }
    Ok(())
}

/// Column introspection used by foreign-key validation and JSON detection.
pub trait Introspect {
    fn columns_of(&self, model: &str) -> Option<Vec<&str>>;
    fn db_type_of(&self, model: &str, column: &str) -> Option<&str>;
}

/// The validated, read-only registry of every model.
#[derive(Debug)]
pub struct Schema {
    models: HashMap<String, Arc<ModelDef>>,
    order: Vec<String>,
    naming: NamingConfig,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    pub fn naming(&self) -> &NamingConfig {
        &self.naming
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ModelDef>> {
        self.models.get(name)
    }

    /// Look up a model, failing with `UnknownModel`.
    pub fn model(&self, name: &str) -> Result<&Arc<ModelDef>> {
        self.models.get(name).ok_or_else(|| {
            Error::definition(
                DefinitionErrorKind::UnknownModel,
                name,
                None,
                "model is not registered",
            )
        })
    }

    /// Models in registration order.
    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelDef>> {
        self.order.iter().filter_map(|name| self.models.get(name))
    }

    /// Look up an association on a model.
    pub fn association(&self, model: &str, name: &str) -> Result<Arc<AssociationDescriptor>> {
        self.model(model)?.association(name).cloned()
    }

    /// Whether `model` is `ancestor` or inherits from it.
    pub fn is_kind_of(&self, model: &str, ancestor: &str) -> bool {
        let mut current = Some(model);
        let mut hops = 0;
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.order.len() {
                return false;
            }
            current = self
                .models
                .get(name)
                .and_then(|m| m.sti.as_ref())
                .map(|sti| sti.parent.as_str());
        }
        false
    }

    /// The concrete model for a row read through `model`: an STI descendant
    /// named by the row's discriminator, else `model` itself.
    pub fn concrete_model(&self, model: &Arc<ModelDef>, sti_value: Option<&str>) -> Arc<ModelDef> {
        match sti_value {
            Some(name) if name != model.name && self.is_kind_of(name, &model.name) => self
                .models
                .get(name)
                .cloned()
                .unwrap_or_else(|| Arc::clone(model)),
            _ => Arc::clone(model),
        }
    }
}

impl Introspect for Schema {
    fn columns_of(&self, model: &str) -> Option<Vec<&str>> {
        self.models
            .get(model)
            .map(|m| m.column_names().collect())
    }

    fn db_type_of(&self, model: &str, column: &str) -> Option<&str> {
        self.models
            .get(model)
            .and_then(|m| m.column(column))
            .map(|c| c.db_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::AssociationDescriptor;
    use crate::filter::FilterOp;

    fn blog() -> SchemaBuilder {
        SchemaBuilder::new()
            .model(
                ModelBuilder::new("User")
                    .column("name", "text")
                    .soft_delete()
                    .timestamps()
                    .sti_base()
                    .association(AssociationDescriptor::has_many("posts", "Post")),
            )
            .model(ModelBuilder::new("Admin").sti_parent("User").column("level", "integer"))
            .model(
                ModelBuilder::new("Post")
                    .column("userId", "bigint")
                    .column("title", "text")
                    .association(AssociationDescriptor::belongs_to("user", "User")),
            )
    }

    #[test]
    fn build_assigns_tables_and_slots() {
        let schema = blog().build().unwrap();
        let user = schema.model("User").unwrap();
        assert_eq!(user.table, "users");
        assert_eq!(user.primary_key, "id");
        assert_eq!(user.slot_of("id"), Some(0));
        assert!(user.has_column("deletedAt"));
        assert!(user.has_column("createdAt"));
        assert!(user.has_column("type"));
        assert_eq!(schema.db_type_of("Post", "userId"), Some("bigint"));
        assert!(schema.columns_of("Post").unwrap().contains(&"title"));
    }

    #[test]
    fn sti_child_inherits_table_and_associations() {
        let schema = blog().build().unwrap();
        let admin = schema.model("Admin").unwrap();
        assert_eq!(admin.table, "users");
        assert!(admin.has_column("level"));
        assert!(admin.has_column("name"));
        assert!(admin.associations.contains("posts"));
        assert_eq!(admin.polymorphic_name(), "User");
        assert!(schema.is_kind_of("Admin", "User"));
        assert!(!schema.is_kind_of("User", "Admin"));

        let sti = admin.scopes.get(STI_SCOPE).unwrap();
        assert_eq!(sti.filters[0].op, FilterOp::Eq("Admin".into()));
        assert!(admin.scopes.get(SOFT_DELETE_SCOPE).is_some());
        assert!(schema.model("User").unwrap().scopes.get(STI_SCOPE).is_none());
    }

    #[test]
    fn sti_scope_covers_descendants() {
        let schema = blog()
            .model(ModelBuilder::new("SuperAdmin").sti_parent("Admin"))
            .build()
            .unwrap();
        let admin = schema.model("Admin").unwrap();
        let sti = admin.scopes.get(STI_SCOPE).unwrap();
        assert_eq!(
            sti.filters[0].op,
            FilterOp::In(vec!["Admin".into(), "SuperAdmin".into()])
        );
    }

    #[test]
    fn concrete_model_picks_sti_child() {
        let schema = blog().build().unwrap();
        let user = schema.model("User").unwrap();
        assert_eq!(schema.concrete_model(user, Some("Admin")).name, "Admin");
        assert_eq!(schema.concrete_model(user, Some("Post")).name, "User");
        assert_eq!(schema.concrete_model(user, None).name, "User");
    }

    #[test]
    fn rejects_missing_global_name() {
        let err = SchemaBuilder::new()
            .model(ModelBuilder::new(""))
            .build()
            .unwrap_err();
        assert_eq!(
            err.definition_kind(),
            Some(DefinitionErrorKind::MissingGlobalName)
        );
    }

    #[test]
    fn rejects_duplicates() {
        let err = SchemaBuilder::new()
            .model(ModelBuilder::new("User"))
            .model(ModelBuilder::new("User"))
            .build()
            .unwrap_err();
        assert_eq!(err.definition_kind(), Some(DefinitionErrorKind::DuplicateModel));

        let err = SchemaBuilder::new()
            .model(
                ModelBuilder::new("User")
                    .association(AssociationDescriptor::has_many("posts", "User"))
                    .association(AssociationDescriptor::has_many("posts", "User")),
            )
            .build()
            .unwrap_err();
        assert_eq!(
            err.definition_kind(),
            Some(DefinitionErrorKind::DuplicateAssociation)
        );
    }

    #[test]
    fn rejects_unknown_target_and_sti_parent() {
        let err = SchemaBuilder::new()
            .model(ModelBuilder::new("Post").association(AssociationDescriptor::belongs_to("user", "User")))
            .build()
            .unwrap_err();
        assert_eq!(err.definition_kind(), Some(DefinitionErrorKind::UnknownModel));

        let err = SchemaBuilder::new()
            .model(ModelBuilder::new("User"))
            .model(ModelBuilder::new("Admin").sti_parent("User"))
            .build()
            .unwrap_err();
        assert_eq!(err.definition_kind(), Some(DefinitionErrorKind::InvalidStiParent));
    }

    #[test]
    fn rejects_dependent_destroy_with_parameterized_where() {
        let err = SchemaBuilder::new()
            .model(
                ModelBuilder::new("User").association(
                    AssociationDescriptor::has_many("posts", "Post")
                        .where_required("title")
                        .dependent_destroy(),
                ),
            )
            .model(ModelBuilder::new("Post").column("userId", "bigint").column("title", "text"))
            .build()
            .unwrap_err();
        assert_eq!(
            err.definition_kind(),
            Some(DefinitionErrorKind::DependentDestroyWithParameterizedWhere)
        );
    }

    #[test]
    fn rejects_unknown_filter_column() {
        let err = SchemaBuilder::new()
            .model(
                ModelBuilder::new("User").association(
                    AssociationDescriptor::has_many("posts", "Post")
                        .where_filter(Filter::eq("published", true)),
                ),
            )
            .model(ModelBuilder::new("Post").column("userId", "bigint"))
            .build()
            .unwrap_err();
        assert_eq!(err.definition_kind(), Some(DefinitionErrorKind::UnknownColumn));
    }

    #[test]
    fn missing_association_lookup() {
        let schema = blog().build().unwrap();
        let err = schema.association("Post", "comments").unwrap_err();
        assert_eq!(
            err.association_kind(),
            Some(AssociationErrorKind::MissingAssociation)
        );
    }
}
