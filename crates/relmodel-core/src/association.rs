//! Association descriptors and the per-model association registry.
//!
//! Associations are declared with the builder methods on
//! [`AssociationDescriptor`] and handed to a [`ModelBuilder`]. When the
//! schema is built, foreign keys and discriminator columns are resolved and
//! validated, after which every descriptor is immutable and shared through
//! `Arc`.
//!
//! ```ignore
//! let posts = AssociationDescriptor::has_many("posts", "Post").dependent_destroy();
//! let author = AssociationDescriptor::belongs_to("author", "User").foreign_key("userId");
//! let comments = AssociationDescriptor::has_many("comments", "Comment").through("posts");
//! ```
//!
//! [`ModelBuilder`]: crate::schema::ModelBuilder

use crate::error::{AssociationErrorKind, Error, Result};
use crate::filter::{Filter, FilterOp, Order};
use std::collections::HashMap;
use std::sync::Arc;

/// The kind of edge between two models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// The owner stores the foreign key: `Post belongs_to User`.
    BelongsTo,
    /// The target stores the foreign key; at most one target row.
    HasOne,
    /// The target stores the foreign key; any number of target rows.
    HasMany,
}

impl AssociationKind {
    /// Whether the owner's slot holds a collection.
    pub const fn is_collection(self) -> bool {
        matches!(self, AssociationKind::HasMany)
    }
}

/// The model (or closed set of models) an association points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationTarget {
    Model(String),
    /// Candidate models for a polymorphic BelongsTo, selected per row by the
    /// discriminator column.
    Polymorphic(Vec<String>),
}

impl AssociationTarget {
    /// Every model this target can resolve to.
    pub fn candidates(&self) -> &[String] {
        match self {
            AssociationTarget::Model(name) => std::slice::from_ref(name),
            AssociationTarget::Polymorphic(names) => names,
        }
    }
}

/// Cascade behavior when the owner is destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dependent {
    #[default]
    None,
    Destroy,
}

/// The operand side of an association `where`/`where_not` clause.
#[derive(Debug, Clone, PartialEq)]
pub enum AssociationWhereValue {
    /// A concrete comparison.
    Filter(FilterOp),
    /// The caller must narrow this column with a hop filter when joining.
    Required,
    /// Filled in from the plan's passthrough data under the column name.
    Passthrough,
}

/// A filter on a target column declared on the association itself.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationWhere {
    pub column: String,
    pub value: AssociationWhereValue,
}

/// Correlates a target column with an owner column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfWhere {
    pub target_column: String,
    pub owner_column: String,
}

/// Immutable metadata for one association edge.
#[derive(Debug, Clone)]
pub struct AssociationDescriptor {
    pub kind: AssociationKind,
    /// The exposed (`as`) name
    pub name: String,
    pub target: AssociationTarget,
    /// Foreign key as declared; `None` means "infer"
    pub declared_foreign_key: Option<String>,
    pub primary_key_override: Option<String>,
    pub polymorphic: bool,
    /// BelongsTo nullability
    pub optional: bool,
    pub through: Option<String>,
    pub source: Option<String>,
    pub where_: Vec<AssociationWhere>,
    pub where_not: Vec<AssociationWhere>,
    pub self_where: Vec<SelfWhere>,
    pub self_where_not: Vec<SelfWhere>,
    pub dependent: Dependent,
    pub distinct: Option<String>,
    pub order: Vec<Order>,
    pub without_default_scopes: Vec<String>,
    pub(crate) foreign_key: Option<String>,
    pub(crate) discriminator: Option<String>,
}

impl AssociationDescriptor {
    fn new(kind: AssociationKind, name: impl Into<String>, target: AssociationTarget) -> Self {
        Self {
            kind,
            name: name.into(),
            target,
            declared_foreign_key: None,
            primary_key_override: None,
            polymorphic: false,
            optional: false,
            through: None,
            source: None,
            where_: Vec::new(),
            where_not: Vec::new(),
            self_where: Vec::new(),
            self_where_not: Vec::new(),
            dependent: Dependent::None,
            distinct: None,
            order: Vec::new(),
            without_default_scopes: Vec::new(),
            foreign_key: None,
            discriminator: None,
        }
    }

    /// The owner stores `<target>Id`.
    pub fn belongs_to(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            AssociationKind::BelongsTo,
            name,
            AssociationTarget::Model(target.into()),
        )
    }

    /// The owner stores `<name>Id` and `<name>Type`; the target is one of
    /// `candidates`.
    pub fn belongs_to_polymorphic<I, S>(name: impl Into<String>, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut assoc = Self::new(
            AssociationKind::BelongsTo,
            name,
            AssociationTarget::Polymorphic(candidates.into_iter().map(Into::into).collect()),
        );
        assoc.polymorphic = true;
        assoc
    }

    pub fn has_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            AssociationKind::HasOne,
            name,
            AssociationTarget::Model(target.into()),
        )
    }

    pub fn has_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            AssociationKind::HasMany,
            name,
            AssociationTarget::Model(target.into()),
        )
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.declared_foreign_key = Some(column.into());
        self
    }

    /// Key on the "one" side used instead of its primary key.
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key_override = Some(column.into());
        self
    }

    /// Mark a HasOne/HasMany as the inverse of a polymorphic BelongsTo: the
    /// target's discriminator column must equal the owner's type name.
    pub fn polymorphic(mut self) -> Self {
        self.polymorphic = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn through(mut self, association: impl Into<String>) -> Self {
        self.through = Some(association.into());
        self
    }

    pub fn source(mut self, association: impl Into<String>) -> Self {
        self.source = Some(association.into());
        self
    }

    pub fn where_filter(mut self, filter: Filter) -> Self {
        self.where_.push(AssociationWhere {
            column: filter.column,
            value: AssociationWhereValue::Filter(filter.op),
        });
        self
    }

    pub fn where_not_filter(mut self, filter: Filter) -> Self {
        self.where_not.push(AssociationWhere {
            column: filter.column,
            value: AssociationWhereValue::Filter(filter.op),
        });
        self
    }

    /// The caller must supply a value for `column` when joining this edge.
    pub fn where_required(mut self, column: impl Into<String>) -> Self {
        self.where_.push(AssociationWhere {
            column: column.into(),
            value: AssociationWhereValue::Required,
        });
        self
    }

    pub fn where_not_required(mut self, column: impl Into<String>) -> Self {
        self.where_not.push(AssociationWhere {
            column: column.into(),
            value: AssociationWhereValue::Required,
        });
        self
    }

    /// `column` equals the plan's passthrough value of the same name.
    pub fn where_passthrough(mut self, column: impl Into<String>) -> Self {
        self.where_.push(AssociationWhere {
            column: column.into(),
            value: AssociationWhereValue::Passthrough,
        });
        self
    }

    pub fn self_where(
        mut self,
        target_column: impl Into<String>,
        owner_column: impl Into<String>,
    ) -> Self {
        self.self_where.push(SelfWhere {
            target_column: target_column.into(),
            owner_column: owner_column.into(),
        });
        self
    }

    pub fn self_where_not(
        mut self,
        target_column: impl Into<String>,
        owner_column: impl Into<String>,
    ) -> Self {
        self.self_where_not.push(SelfWhere {
            target_column: target_column.into(),
            owner_column: owner_column.into(),
        });
        self
    }

    pub fn dependent_destroy(mut self) -> Self {
        self.dependent = Dependent::Destroy;
        self
    }

    pub fn distinct(mut self, column: impl Into<String>) -> Self {
        self.distinct = Some(column.into());
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    /// Skip the named default scope of the target when traversing this edge.
    pub fn without_default_scope(mut self, scope: impl Into<String>) -> Self {
        self.without_default_scopes.push(scope.into());
        self
    }

    pub fn is_through(&self) -> bool {
        self.through.is_some()
    }

    /// A BelongsTo whose target varies per row.
    pub fn is_polymorphic_belongs_to(&self) -> bool {
        self.kind == AssociationKind::BelongsTo
            && matches!(self.target, AssociationTarget::Polymorphic(_))
    }

    /// The resolved foreign-key column. Empty for through associations.
    pub fn foreign_key_column(&self) -> &str {
        self.foreign_key.as_deref().unwrap_or_default()
    }

    /// The resolved discriminator column of a polymorphic edge.
    pub fn discriminator_column(&self) -> Option<&str> {
        self.discriminator.as_deref()
    }

    /// The single model this association targets.
    pub fn target_model(&self) -> Result<&str> {
        match &self.target {
            AssociationTarget::Model(name) => Ok(name),
            AssociationTarget::Polymorphic(_) => Err(Error::association(
                AssociationErrorKind::CannotDerivePrimaryKeyFromPolymorphic,
                "",
                self.name.as_str(),
                "a polymorphic association has no single target model",
            )),
        }
    }

    /// Column on the owner side of the join condition.
    pub fn owner_column<'a>(&'a self, owner_primary_key: &'a str) -> &'a str {
        match self.kind {
            AssociationKind::BelongsTo => self.foreign_key_column(),
            AssociationKind::HasOne | AssociationKind::HasMany => self
                .primary_key_override
                .as_deref()
                .unwrap_or(owner_primary_key),
        }
    }

    /// Column on the target side of the join condition.
    pub fn target_column<'a>(&'a self, target_primary_key: &'a str) -> &'a str {
        match self.kind {
            AssociationKind::BelongsTo => self
                .primary_key_override
                .as_deref()
                .unwrap_or(target_primary_key),
            AssociationKind::HasOne | AssociationKind::HasMany => self.foreign_key_column(),
        }
    }

    /// Whether a `Required` filter on `column` must be satisfied by the caller.
    pub fn requires(&self, column: &str) -> bool {
        self.where_
            .iter()
            .chain(&self.where_not)
            .any(|w| w.column == column && w.value == AssociationWhereValue::Required)
    }

    /// Whether any association filter needs a value supplied at call time.
    pub fn has_parameterized_where(&self) -> bool {
        self.where_
            .iter()
            .chain(&self.where_not)
            .any(|w| !matches!(w.value, AssociationWhereValue::Filter(_)))
    }
}

/// Per-model table of association descriptors, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct AssociationRegistry {
    associations: Vec<Arc<AssociationDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl AssociationRegistry {
    pub(crate) fn from_descriptors(descriptors: Vec<AssociationDescriptor>) -> Self {
        let mut registry = Self::default();
        for descriptor in descriptors {
            registry
                .by_name
                .insert(descriptor.name.clone(), registry.associations.len());
            registry.associations.push(Arc::new(descriptor));
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AssociationDescriptor>> {
        self.by_name.get(name).map(|&i| &self.associations[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Descriptors in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AssociationDescriptor>> {
        self.associations.iter()
    }

    /// Associations that cascade on destroy, in declaration order.
    pub fn dependents(&self) -> impl Iterator<Item = &Arc<AssociationDescriptor>> {
        self.associations
            .iter()
            .filter(|a| a.dependent == Dependent::Destroy)
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }
}
