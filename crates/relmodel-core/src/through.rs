//! Through-association resolution.
//!
//! A through association `A` on `T` with `through = B` is flattened into the
//! chain of concrete associations it traverses: first `B` on `T` (itself
//! expanded if it is a through association), then the source association on
//! `B`'s target (expanded recursively). Join compilation and preload
//! hydration both walk the resulting [`ThroughPath`], so they cannot
//! disagree about what a through association means.

use crate::association::{AssociationDescriptor, AssociationKind};
use crate::error::{AssociationErrorKind, Error, Result};
use crate::naming::{pluralize, singularize};
use crate::schema::Schema;
use std::sync::Arc;

const MAX_THROUGH_DEPTH: usize = 32;

/// One concrete association in a resolved chain.
#[derive(Debug, Clone)]
pub struct ThroughHop {
    /// Model that declares `association`
    pub owner: String,
    pub association: Arc<AssociationDescriptor>,
}

/// A flat chain of concrete hops from an owner model to the leaf target.
#[derive(Debug, Clone)]
pub struct ThroughPath {
    pub owner: String,
    /// The association the path was resolved from
    pub name: String,
    pub hops: Vec<ThroughHop>,
    /// For a through association: how many leading hops the intermediate
    /// association expands to, and the source association it continues with
    /// on the intermediate model.
    pub bridge: Option<(usize, String)>,
}

impl ThroughPath {
    /// The final concrete association.
    pub fn leaf(&self) -> &ThroughHop {
        // Resolution never produces an empty path.
        &self.hops[self.hops.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Whether the owner can reach more than one leaf record.
    pub fn is_collection(&self) -> bool {
        self.hops
            .iter()
            .any(|hop| hop.association.kind == AssociationKind::HasMany)
    }
}

/// Resolve `association` on `owner` into a flat path of concrete hops.
///
/// Non-through associations resolve to a single hop. Errors describe the
/// first hop that cannot be resolved.
pub fn resolve_path(schema: &Schema, owner: &str, association: &str) -> Result<ThroughPath> {
    let model = schema.model(owner)?;
    let descriptor = model.association(association)?;
    let mut hops = Vec::new();
    let bridge = expand(schema, owner, descriptor, &mut hops, 0)?;
    Ok(ThroughPath {
        owner: owner.to_string(),
        name: association.to_string(),
        hops,
        bridge,
    })
}

fn expand(
    schema: &Schema,
    owner: &str,
    assoc: &Arc<AssociationDescriptor>,
    hops: &mut Vec<ThroughHop>,
    depth: usize,
) -> Result<Option<(usize, String)>> {
    let Some(through) = &assoc.through else {
        hops.push(ThroughHop {
            owner: owner.to_string(),
            association: Arc::clone(assoc),
        });
        return Ok(None);
    };
    if depth > MAX_THROUGH_DEPTH {
        return Err(Error::association(
            AssociationErrorKind::MissingThroughAssociation,
            owner,
            assoc.name.as_str(),
            "through chain does not terminate",
        ));
    }

    let model = schema.model(owner)?;
    let Some(intermediate) = model.associations.get(through) else {
        return Err(Error::association(
            AssociationErrorKind::MissingThroughAssociation,
            owner,
            assoc.name.as_str(),
            format!("{} has no association named '{}' to go through", owner, through),
        ));
    };

    expand(schema, owner, intermediate, hops, depth + 1)?;

    // The hop we just appended determines the intermediate model.
    let bridge = &hops[hops.len() - 1];
    if bridge.association.is_polymorphic_belongs_to() {
        return Err(cannot_cross_polymorphic(owner, assoc, &bridge.association));
    }
    let bridge_owner = bridge.owner.clone();
    let intermediate_model = bridge
        .association
        .target_model()
        .map_err(|_| cannot_cross_polymorphic(&bridge_owner, assoc, &bridge.association))?
        .to_string();

    let source_name = assoc.source.as_deref().unwrap_or(assoc.name.as_str());
    let target = schema.model(&intermediate_model)?;
    let source = [
        source_name.to_string(),
        singularize(source_name),
        pluralize(source_name),
    ]
    .iter()
    .find_map(|candidate| target.associations.get(candidate))
    .cloned();
    let Some(source) = source else {
        return Err(Error::association(
            AssociationErrorKind::MissingThroughAssociationSource,
            intermediate_model.as_str(),
            source_name,
            format!(
                "{} has no source association named '{}' (or its singular/plural form)",
                intermediate_model, source_name
            ),
        ));
    };
    if source.is_polymorphic_belongs_to() {
        return Err(cannot_cross_polymorphic(&intermediate_model, assoc, &source));
    }

    let bridge_hops = hops.len();
    expand(schema, &intermediate_model, &source, hops, depth + 1)?;
    Ok(Some((bridge_hops, source.name.clone())))
}

fn cannot_cross_polymorphic(
    owner: &str,
    assoc: &AssociationDescriptor,
    polymorphic: &AssociationDescriptor,
) -> Error {
    Error::association(
        AssociationErrorKind::CannotAssociateThroughPolymorphic,
        owner,
        assoc.name.as_str(),
        format!(
            "through chains cannot cross the polymorphic association '{}'",
            polymorphic.name
        ),
    )
}
