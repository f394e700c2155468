//! Foreign-key and discriminator resolution.
//!
//! Runs once per association while the schema is built. BelongsTo keys live
//! on the owner's table; HasOne/HasMany keys live on the target's table.
//! Inferred keys are `lowerCamel(singular(table)) + "Id"`, where the table is
//! the target's for BelongsTo and the owner's otherwise. A polymorphic
//! BelongsTo cannot name a single target table, so it infers `<name>Id`.

use crate::association::{AssociationDescriptor, AssociationKind, AssociationTarget};
use crate::error::{DefinitionErrorKind, Error, Result};
use crate::naming::NamingConfig;
use crate::schema::ModelDef;

/// Resolve and validate the foreign key (and discriminator, for polymorphic
/// edges) of `assoc`, storing them on the descriptor.
///
/// Through associations are left untouched: their leaf is a concrete
/// association validated on its own model.
pub fn resolve_foreign_key<'m, F>(
    owner: &ModelDef,
    assoc: &mut AssociationDescriptor,
    lookup: F,
    naming: &NamingConfig,
) -> Result<()>
where
    F: Fn(&str) -> Option<&'m ModelDef>,
{
    if assoc.is_through() {
        return Ok(());
    }

    let find = |name: &str| {
        lookup(name).ok_or_else(|| {
            Error::definition(
                DefinitionErrorKind::UnknownModel,
                owner.name.as_str(),
                Some(&assoc.name),
                format!("association target '{}' is not registered", name),
            )
        })
    };
    let explicit = assoc.declared_foreign_key.is_some();

    let (foreign_key, discriminator) = match assoc.kind {
        AssociationKind::BelongsTo => {
            let foreign_key = match (&assoc.declared_foreign_key, &assoc.target) {
                (Some(fk), _) => fk.clone(),
                (None, AssociationTarget::Model(target)) => {
                    naming.foreign_key_for_table(&find(target)?.table)
                }
                (None, AssociationTarget::Polymorphic(_)) => naming.foreign_key_for_name(&assoc.name),
            };
            check_key_column(owner, owner, assoc, &foreign_key, explicit)?;

            let discriminator = if assoc.is_polymorphic_belongs_to() {
                let column = naming.discriminator_for(&foreign_key);
                check_key_column(owner, owner, assoc, &column, explicit)?;
                Some(column)
            } else {
                None
            };

            if let Some(pk) = &assoc.primary_key_override {
                for candidate in assoc.target.candidates() {
                    let target = find(candidate)?;
                    if !target.has_column(pk) {
                        return Err(unknown_column(owner, assoc, target, pk));
                    }
                }
            }
            (foreign_key, discriminator)
        }
        AssociationKind::HasOne | AssociationKind::HasMany => {
            let target = find(assoc.target_model().map_err(|_| {
                Error::definition(
                    DefinitionErrorKind::UnknownModel,
                    owner.name.as_str(),
                    Some(&assoc.name),
                    "HasOne/HasMany associations take a single target model",
                )
            })?)?;
            let foreign_key = assoc
                .declared_foreign_key
                .clone()
                .unwrap_or_else(|| naming.foreign_key_for_table(&owner.table));
            check_key_column(owner, target, assoc, &foreign_key, explicit)?;

            let discriminator = if assoc.polymorphic {
                let column = naming.discriminator_for(&foreign_key);
                check_key_column(owner, target, assoc, &column, explicit)?;
                Some(column)
            } else {
                None
            };

            if let Some(pk) = &assoc.primary_key_override {
                if !owner.has_column(pk) {
                    return Err(unknown_column(owner, assoc, owner, pk));
                }
            }
            (foreign_key, discriminator)
        }
    };

    tracing::trace!(
        model = %owner.name,
        association = %assoc.name,
        foreign_key = %foreign_key,
        discriminator = ?discriminator,
        inferred = !explicit,
        "Resolved foreign key"
    );
    assoc.foreign_key = Some(foreign_key);
    assoc.discriminator = discriminator;
    Ok(())
}

fn check_key_column(
    owner: &ModelDef,
    table_model: &ModelDef,
    assoc: &AssociationDescriptor,
    column: &str,
    explicit: bool,
) -> Result<()> {
    if table_model.has_column(column) {
        return Ok(());
    }
    let (kind, message) = if explicit {
        (
            DefinitionErrorKind::ExplicitForeignKeyInvalid,
            format!(
                "foreign key '{}' does not exist on table '{}'",
                column, table_model.table
            ),
        )
    } else {
        (
            DefinitionErrorKind::InvalidComputedForeignKey,
            format!(
                "computed foreign key '{}' does not exist on table '{}'; declare foreign_key explicitly",
                column, table_model.table
            ),
        )
    };
    Err(Error::definition(
        kind,
        owner.name.as_str(),
        Some(&assoc.name),
        message,
    ))
}

fn unknown_column(
    owner: &ModelDef,
    assoc: &AssociationDescriptor,
    table_model: &ModelDef,
    column: &str,
) -> Error {
    Error::definition(
        DefinitionErrorKind::UnknownColumn,
        owner.name.as_str(),
        Some(&assoc.name),
        format!(
            "primary key override '{}' does not exist on table '{}'",
            column, table_model.table
        ),
    )
}
