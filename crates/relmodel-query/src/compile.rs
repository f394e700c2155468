//! Plan compilation.
//!
//! Turns a [`QueryPlan`] into an abstract [`SelectStatement`]: root filters
//! and scopes, association joins expanded hop by hop, anchoring subqueries
//! for association-scoped plans, ordering and the requested projection.
//!
//! The per-edge rules (association filters, edge scopes, polymorphic
//! discriminators) live in free functions so the preload hydrator builds
//! its batch queries with exactly the same semantics.

use crate::join::JoinPath;
use crate::plan::{Anchor, QueryContext, QueryPlan};
use relmodel_core::{
    AssociationDescriptor, AssociationErrorKind, AssociationWhereValue, BinaryOp, ColumnRef,
    DefinitionErrorKind, Error, Expr, Filter, Join, JoinKind, ModelDef, OrderBy, Projection,
    Result, Schema, ScopeDescriptor, SelectStatement, ThroughHop, ThroughPath, Value, resolve_path,
};
use std::collections::HashMap;
use std::sync::Arc;

/// What a compiled plan returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Every column of the root model.
    Records,
    /// The listed root columns.
    Pluck(Vec<String>),
    Count,
    Min(String),
    Max(String),
    /// At most one primary key.
    Exists,
}

/// Compile `plan` into a select statement.
///
/// Every association name, column and scope is resolved here, so a plan
/// that compiles never fails for definition reasons at execution time.
#[tracing::instrument(level = "trace", skip(schema, plan), fields(model = plan.model()))]
pub fn compile(schema: &Schema, plan: &QueryPlan, selection: &Selection) -> Result<SelectStatement> {
    let model = schema.model(plan.model())?;
    let alias = plan.alias_name().unwrap_or(model.table.as_str()).to_string();
    let mut compiler = Compiler::new(schema, plan.context());
    let mut stmt = SelectStatement::new(model.table.clone(), alias.clone());
    let mut conditions = Vec::new();

    for filter in plan.filters() {
        check_column(model, &filter.column)?;
        conditions.push(Expr::filter(&alias, filter));
    }
    for filter in plan.filters_not() {
        check_column(model, &filter.column)?;
        conditions.push(Expr::filter_not(&alias, filter));
    }
    for group in plan.any_groups() {
        for filter in group {
            check_column(model, &filter.column)?;
        }
        conditions.push(Expr::or_all(group.iter().map(|f| Expr::filter(&alias, f))));
    }

    // An association-scoped plan's root is the association's leaf, so the
    // edge's own scope exemptions apply to it.
    let root_skip = match plan.anchor() {
        Some(anchor) => anchor_skip_scopes(schema, anchor)?,
        None => Vec::new(),
    };
    for scope in plan.bypass().root_scopes(&model.scopes) {
        if !root_skip.contains(&scope.name) {
            conditions.extend(scope_conditions(&alias, scope));
        }
    }
    for name in plan.selected_scopes() {
        let scope = model.scopes.get(name).ok_or_else(|| {
            Error::definition(
                DefinitionErrorKind::UnknownScope,
                model.name.as_str(),
                None,
                format!("{} has no scope named '{}'", model.name, name),
            )
        })?;
        conditions.extend(scope_conditions(&alias, scope));
    }

    if let Some(anchor) = plan.anchor() {
        conditions.push(compiler.anchor_condition(model, &alias, anchor)?);
    }
    for path in plan.join_paths() {
        compiler.join_path(model, &alias, path)?;
    }

    for order in plan.orders() {
        check_column(model, &order.column)?;
        stmt.order_by.push(OrderBy {
            column: ColumnRef::new(alias.as_str(), order.column.as_str()),
            direction: order.direction,
        });
    }
    stmt.order_by.append(&mut compiler.orders);

    stmt.distinct = match plan.distinct_column() {
        Some(column) => {
            check_column(model, column)?;
            Some(ColumnRef::new(alias.as_str(), column))
        }
        None => compiler.distinct.take(),
    };
    stmt.limit = plan.limit_value();
    stmt.offset = plan.offset_value();
    stmt.joins = compiler.joins;
    stmt.filter = Expr::and_all(conditions);

    stmt.projection = match selection {
        Selection::Records => Projection::All,
        Selection::Pluck(columns) => {
            let mut refs = Vec::with_capacity(columns.len());
            for column in columns {
                check_column(model, column)?;
                refs.push(ColumnRef::new(alias.as_str(), column.as_str()));
            }
            Projection::Columns(refs)
        }
        Selection::Count => {
            stmt.order_by.clear();
            Projection::Count
        }
        Selection::Min(column) => {
            check_column(model, column)?;
            Projection::Min(ColumnRef::new(alias.as_str(), column.as_str()))
        }
        Selection::Max(column) => {
            check_column(model, column)?;
            Projection::Max(ColumnRef::new(alias.as_str(), column.as_str()))
        }
        Selection::Exists => {
            stmt.limit = Some(1);
            Projection::Columns(vec![ColumnRef::new(
                alias.as_str(),
                model.primary_key.as_str(),
            )])
        }
    };

    tracing::trace!(statement = %stmt, "compiled plan");
    Ok(stmt)
}

struct Compiler<'a> {
    schema: &'a Schema,
    ctx: &'a QueryContext,
    aliases: usize,
    joins: Vec<Join>,
    orders: Vec<OrderBy>,
    distinct: Option<ColumnRef>,
    /// Unfiltered hops already joined, keyed by (owner alias, association).
    seen: HashMap<(String, String), (Arc<ModelDef>, String)>,
}

impl<'a> Compiler<'a> {
    fn new(schema: &'a Schema, ctx: &'a QueryContext) -> Self {
        Self {
            schema,
            ctx,
            aliases: 0,
            joins: Vec::new(),
            orders: Vec::new(),
            distinct: None,
            seen: HashMap::new(),
        }
    }

    fn join_path(&mut self, root: &Arc<ModelDef>, root_alias: &str, path: &JoinPath) -> Result<()> {
        let mut owner = Arc::clone(root);
        let mut owner_alias = root_alias.to_string();
        for segment in path.segments() {
            let through = resolve_path(self.schema, &owner.name, &segment.association)?;
            let descriptor = Arc::clone(owner.association(&segment.association)?);
            let routed = route_filters(&through, &segment.filters, &segment.filters_not);
            let last = through.len().saturating_sub(1);
            for (i, (hop, (filters, filters_not))) in through.hops.iter().zip(&routed).enumerate() {
                let skip: &[String] = if i == last && through.bridge.is_some() {
                    &descriptor.without_default_scopes
                } else {
                    &[]
                };
                let reusable = filters.is_empty() && filters_not.is_empty() && skip.is_empty();
                let key = (owner_alias.clone(), hop.association.name.clone());
                if reusable {
                    if let Some((model, alias)) = self.seen.get(&key) {
                        owner = Arc::clone(model);
                        owner_alias = alias.clone();
                        continue;
                    }
                }
                let (target, alias) =
                    self.join_hop(&owner, &owner_alias, hop, filters, filters_not, skip)?;
                if reusable {
                    self.seen.insert(key, (Arc::clone(&target), alias.clone()));
                }
                owner = target;
                owner_alias = alias;
            }
        }
        Ok(())
    }

    fn join_hop(
        &mut self,
        owner: &ModelDef,
        owner_alias: &str,
        hop: &ThroughHop,
        filters: &[Filter],
        filters_not: &[Filter],
        skip_scopes: &[String],
    ) -> Result<(Arc<ModelDef>, String)> {
        let assoc = &hop.association;
        let mut on = Vec::new();
        let mut target_filters: Vec<&Filter> = filters.iter().collect();

        let target = if assoc.is_polymorphic_belongs_to() {
            let discriminator = assoc.discriminator_column().unwrap_or_default();
            let type_name = narrowed_type(assoc, filters).ok_or_else(|| {
                Error::association(
                    AssociationErrorKind::CannotJoinPolymorphicBelongsTo,
                    hop.owner.as_str(),
                    assoc.name.as_str(),
                    format!(
                        "joining '{}' needs a filter pinning '{}' to one of {}",
                        assoc.name,
                        discriminator,
                        assoc.target.candidates().join(", ")
                    ),
                )
            })?;
            target_filters.retain(|f| f.column != discriminator);
            on.push(Expr::filter(owner_alias, &Filter::eq(discriminator, type_name)));
            Arc::clone(self.schema.model(type_name)?)
        } else {
            Arc::clone(self.schema.model(assoc.target_model()?)?)
        };

        self.aliases += 1;
        let alias = format!("{}_{}", assoc.name, self.aliases);

        on.push(Expr::eq(
            Expr::col(owner_alias, assoc.owner_column(&owner.primary_key)),
            Expr::col(alias.as_str(), assoc.target_column(&target.primary_key)),
        ));
        if let Some(discriminator) = owner_side_discriminator(assoc) {
            on.push(Expr::filter(
                &alias,
                &Filter::eq(discriminator, owner.polymorphic_name()),
            ));
        }
        on.extend(association_conditions(
            &hop.owner,
            assoc,
            &alias,
            filters,
            filters_not,
            self.ctx,
        )?);
        for self_where in &assoc.self_where {
            on.push(Expr::eq(
                Expr::col(alias.as_str(), self_where.target_column.as_str()),
                Expr::col(owner_alias, self_where.owner_column.as_str()),
            ));
        }
        for self_where in &assoc.self_where_not {
            on.push(Expr::binary(
                Expr::col(alias.as_str(), self_where.target_column.as_str()),
                BinaryOp::NotEq,
                Expr::col(owner_alias, self_where.owner_column.as_str()),
            ));
        }
        for scope in edge_scopes(self.ctx, &target, assoc, skip_scopes) {
            on.extend(scope_conditions(&alias, scope));
        }
        for filter in target_filters {
            check_column(&target, &filter.column)?;
            on.push(Expr::filter(&alias, filter));
        }
        for filter in filters_not {
            check_column(&target, &filter.column)?;
            on.push(Expr::filter_not(&alias, filter));
        }

        for order in &assoc.order {
            self.orders.push(OrderBy {
                column: ColumnRef::new(alias.as_str(), order.column.as_str()),
                direction: order.direction,
            });
        }
        if let Some(column) = &assoc.distinct {
            self.distinct = Some(ColumnRef::new(alias.as_str(), column.as_str()));
        }

        tracing::trace!(
            owner = %hop.owner,
            association = %assoc.name,
            alias = %alias,
            "joined association hop"
        );
        self.joins.push(Join {
            kind: JoinKind::Inner,
            table: target.table.clone(),
            alias: alias.clone(),
            on: Expr::and_all(on),
        });
        Ok((target, alias))
    }

    /// `root.pk IN (SELECT leaf.pk FROM owner JOIN ... WHERE owner.pk = key)`
    fn anchor_condition(&mut self, root: &ModelDef, root_alias: &str, anchor: &Anchor) -> Result<Expr> {
        let owner = self.schema.model(&anchor.owner)?;
        let path = resolve_path(self.schema, &anchor.owner, &anchor.association)?;
        let descriptor = owner.association(&anchor.association)?;
        let routed = route_filters(&path, &anchor.filters, &[]);
        let mut sub = Compiler::new(self.schema, self.ctx);
        let owner_alias = "anchor";
        let mut current = Arc::clone(owner);
        let mut current_alias = owner_alias.to_string();
        let last = path.len().saturating_sub(1);
        for (i, (hop, (filters, _))) in path.hops.iter().zip(&routed).enumerate() {
            let skip: &[String] = if i == last && path.bridge.is_some() {
                &descriptor.without_default_scopes
            } else {
                &[]
            };
            let (target, alias) = sub.join_hop(&current, &current_alias, hop, filters, &[], skip)?;
            current = target;
            current_alias = alias;
        }

        let leaf = &path.leaf().association;
        for order in &leaf.order {
            self.orders.push(OrderBy {
                column: ColumnRef::new(root_alias, order.column.as_str()),
                direction: order.direction,
            });
        }
        if let Some(column) = &leaf.distinct {
            self.distinct = Some(ColumnRef::new(root_alias, column.as_str()));
        }

        let mut query = SelectStatement::new(owner.table.clone(), owner_alias);
        query.joins = sub.joins;
        query.filter = Expr::filter(
            owner_alias,
            &Filter::eq(owner.primary_key.as_str(), anchor.key.clone()),
        );
        query.projection = Projection::Columns(vec![ColumnRef::new(
            current_alias,
            root.primary_key.as_str(),
        )]);
        Ok(Expr::InSubquery {
            expr: Box::new(Expr::col(root_alias, root.primary_key.as_str())),
            query: Box::new(query),
            negated: false,
        })
    }
}

/// Default scopes the root of an association-scoped plan does not apply:
/// those the association and its leaf edge opt out of.
fn anchor_skip_scopes(schema: &Schema, anchor: &Anchor) -> Result<Vec<String>> {
    let descriptor = schema.association(&anchor.owner, &anchor.association)?;
    let path = resolve_path(schema, &anchor.owner, &anchor.association)?;
    let mut skip = descriptor.without_default_scopes.clone();
    skip.extend(path.leaf().association.without_default_scopes.iter().cloned());
    Ok(skip)
}

/// Default scopes of `target` applied on an edge through `assoc`.
fn edge_scopes<'t>(
    ctx: &QueryContext,
    target: &'t ModelDef,
    assoc: &AssociationDescriptor,
    skip: &[String],
) -> Vec<&'t ScopeDescriptor> {
    ctx.bypass
        .edge_scopes(&target.scopes, assoc)
        .into_iter()
        .filter(|scope| !skip.contains(&scope.name))
        .collect()
}

/// Split caller hop filters over the hops of `path`.
///
/// A filter goes to the first intermediate hop that declares a `Required`
/// filter on its column; everything else constrains the leaf. Joins and
/// preloads both route through here.
pub fn route_filters(
    path: &ThroughPath,
    filters: &[Filter],
    filters_not: &[Filter],
) -> Vec<(Vec<Filter>, Vec<Filter>)> {
    let mut routed = vec![(Vec::new(), Vec::new()); path.len()];
    let Some(last) = path.len().checked_sub(1) else {
        return routed;
    };
    let hop_for = |column: &str| {
        path.hops[..last]
            .iter()
            .position(|hop| hop.association.requires(column))
            .unwrap_or(last)
    };
    for filter in filters {
        routed[hop_for(&filter.column)].0.push(filter.clone());
    }
    for filter in filters_not {
        routed[hop_for(&filter.column)].1.push(filter.clone());
    }
    routed
}

/// The discriminator a polymorphic HasOne/HasMany pins on its target.
fn owner_side_discriminator(assoc: &AssociationDescriptor) -> Option<&str> {
    if assoc.is_polymorphic_belongs_to() {
        None
    } else {
        assoc.discriminator_column()
    }
}

/// The single candidate type a polymorphic BelongsTo hop is narrowed to.
fn narrowed_type<'f>(assoc: &AssociationDescriptor, filters: &'f [Filter]) -> Option<&'f str> {
    let discriminator = assoc.discriminator_column()?;
    filters
        .iter()
        .filter(|f| f.column == discriminator)
        .find_map(Filter::pinned_value)
        .and_then(Value::as_str)
        .filter(|name| assoc.target.candidates().iter().any(|c| c == name))
}

fn check_column(model: &ModelDef, column: &str) -> Result<()> {
    if model.has_column(column) {
        Ok(())
    } else {
        Err(Error::definition(
            DefinitionErrorKind::UnknownColumn,
            model.name.as_str(),
            None,
            format!("{} has no column '{}'", model.name, column),
        ))
    }
}

/// A scope's filters bound to `alias`.
pub fn scope_conditions(alias: &str, scope: &ScopeDescriptor) -> Vec<Expr> {
    scope
        .filters
        .iter()
        .map(|f| Expr::filter(alias, f))
        .chain(scope.filters_not.iter().map(|f| Expr::filter_not(alias, f)))
        .collect()
}

/// An association's own `where` / `where_not` filters bound to `alias`.
///
/// `supplied` and `supplied_not` are the caller's hop filters; a `Required`
/// filter is satisfied when one of them constrains the same column. The hop
/// filters themselves are not part of the result.
pub fn association_conditions(
    owner: &str,
    assoc: &AssociationDescriptor,
    alias: &str,
    supplied: &[Filter],
    supplied_not: &[Filter],
    ctx: &QueryContext,
) -> Result<Vec<Expr>> {
    let mut out = Vec::new();
    for (clauses, negated) in [(&assoc.where_, false), (&assoc.where_not, true)] {
        for clause in clauses {
            let filter = match &clause.value {
                AssociationWhereValue::Filter(op) => Filter::new(clause.column.as_str(), op.clone()),
                AssociationWhereValue::Required => {
                    let satisfied = supplied
                        .iter()
                        .chain(supplied_not)
                        .any(|f| f.column == clause.column);
                    if !satisfied {
                        return Err(Error::association(
                            AssociationErrorKind::MissingRequiredAssociationWhereClause,
                            owner,
                            assoc.name.as_str(),
                            format!(
                                "'{}' requires a filter on '{}'",
                                assoc.name, clause.column
                            ),
                        ));
                    }
                    continue;
                }
                AssociationWhereValue::Passthrough => {
                    let value = ctx.passthrough.get(&clause.column).ok_or_else(|| {
                        Error::association(
                            AssociationErrorKind::MissingPassthroughData,
                            owner,
                            assoc.name.as_str(),
                            format!(
                                "'{}' needs passthrough data for '{}'",
                                assoc.name, clause.column
                            ),
                        )
                    })?;
                    Filter::eq(clause.column.as_str(), value.clone())
                }
            };
            out.push(if negated {
                Expr::filter_not(alias, &filter)
            } else {
                Expr::filter(alias, &filter)
            });
        }
    }
    Ok(out)
}

/// A batch query for one association edge, as issued by the preload
/// hydrator.
#[derive(Debug)]
pub struct EdgeQuery<'a> {
    pub hop: &'a ThroughHop,
    /// Model of the owning records (used for polymorphic discriminators).
    pub owner: &'a ModelDef,
    /// Concrete target model.
    pub target: &'a ModelDef,
    /// Distinct owner-side key values.
    pub keys: Vec<Value>,
    pub filters: &'a [Filter],
    pub filters_not: &'a [Filter],
    /// Default scopes skipped on this edge in addition to the association's.
    pub skip_scopes: &'a [String],
}

/// `SELECT target.* FROM target WHERE target.<key> IN (keys) AND ...`
///
/// Applies the association's filters and order, the target's edge scopes
/// and the polymorphic discriminator. `self_where` and `distinct` depend on
/// each owner and are left to the caller.
pub fn edge_statement(query: &EdgeQuery<'_>, ctx: &QueryContext) -> Result<SelectStatement> {
    let assoc = &query.hop.association;
    let target = query.target;
    let alias = target.table.as_str();
    let mut stmt = SelectStatement::new(target.table.clone(), alias);
    let key_column = assoc.target_column(&target.primary_key);

    let mut conditions = vec![Expr::filter(
        alias,
        &Filter::in_list(key_column, query.keys.clone()),
    )];
    if let Some(discriminator) = owner_side_discriminator(assoc) {
        conditions.push(Expr::filter(
            alias,
            &Filter::eq(discriminator, query.owner.polymorphic_name()),
        ));
    }
    conditions.extend(association_conditions(
        &query.hop.owner,
        assoc,
        alias,
        query.filters,
        query.filters_not,
        ctx,
    )?);
    for scope in edge_scopes(ctx, target, assoc, query.skip_scopes) {
        conditions.extend(scope_conditions(alias, scope));
    }
    for filter in query.filters {
        check_column(target, &filter.column)?;
        conditions.push(Expr::filter(alias, filter));
    }
    for filter in query.filters_not {
        check_column(target, &filter.column)?;
        conditions.push(Expr::filter_not(alias, filter));
    }
    stmt.filter = Expr::and_all(conditions);
    stmt.order_by = assoc
        .order
        .iter()
        .map(|o| OrderBy {
            column: ColumnRef::new(alias, o.column.as_str()),
            direction: o.direction,
        })
        .collect();
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preload::PreloadTree;
    use relmodel_core::{
        AssociationDescriptor as Assoc, ModelBuilder, Order, OrderDirection, SOFT_DELETE_SCOPE,
        STI_SCOPE, ScopeDescriptor, SchemaBuilder,
    };

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new()
            .model(
                ModelBuilder::new("User")
                    .column("name", "text")
                    .column("teamId", "bigint")
                    .soft_delete()
                    .sti_base()
                    .association(Assoc::has_many("posts", "Post").order(Order::desc("createdAt")))
                    .association(Assoc::has_many("comments", "Comment").through("posts"))
                    .association(
                        Assoc::has_many("allPosts", "Post")
                            .foreign_key("userId")
                            .without_default_scope(SOFT_DELETE_SCOPE),
                    )
                    .association(
                        Assoc::has_many("localePosts", "Post")
                            .foreign_key("userId")
                            .where_required("locale"),
                    )
                    .association(
                        Assoc::has_many("localeComments", "Comment")
                            .through("localePosts")
                            .source("comments"),
                    )
                    .association(
                        Assoc::has_many("allPostComments", "Comment")
                            .through("posts")
                            .without_default_scope(SOFT_DELETE_SCOPE),
                    )
                    .association(
                        Assoc::has_many("images", "Image")
                            .foreign_key("imageableId")
                            .polymorphic(),
                    )
                    .scope(ScopeDescriptor::named("named_bob", vec![Filter::eq("name", "bob")])),
            )
            .model(ModelBuilder::new("Admin").sti_parent("User"))
            .model(
                ModelBuilder::new("Post")
                    .column("userId", "bigint")
                    .column("title", "text")
                    .column("locale", "text")
                    .soft_delete()
                    .timestamps()
                    .association(Assoc::belongs_to("user", "User"))
                    .association(Assoc::has_many("comments", "Comment"))
                    .association(
                        Assoc::has_many("translations", "Translation")
                            .foreign_key("postId")
                            .where_required("locale"),
                    )
                    .association(
                        Assoc::has_many("localized", "Translation")
                            .foreign_key("postId")
                            .where_passthrough("locale"),
                    ),
            )
            .model(
                ModelBuilder::new("Comment")
                    .column("postId", "bigint")
                    .column("body", "text")
                    .column("commentableId", "bigint")
                    .column("commentableType", "text")
                    .association(Assoc::belongs_to("post", "Post"))
                    .association(Assoc::belongs_to_polymorphic("commentable", ["Post", "User"])),
            )
            .model(
                ModelBuilder::new("Translation")
                    .column("postId", "bigint")
                    .column("locale", "text"),
            )
            .model(
                ModelBuilder::new("Image")
                    .column("imageableId", "bigint")
                    .column("imageableType", "text")
                    .association(Assoc::belongs_to_polymorphic("imageable", ["User"])),
            )
            .build()
            .unwrap()
    }

    fn records(schema: &Schema, plan: &QueryPlan) -> SelectStatement {
        compile(schema, plan, &Selection::Records).unwrap()
    }

    #[test]
    fn root_default_scopes_apply() {
        let schema = schema();
        let stmt = records(&schema, &QueryPlan::new("Post"));
        assert_eq!(
            stmt.to_string(),
            "SELECT posts.* FROM \"posts\" AS posts WHERE posts.\"deletedAt\" IS NULL"
        );
    }

    #[test]
    fn sti_child_adds_type_filter_and_keeps_it_without_soft_delete() {
        let schema = schema();
        let plan = QueryPlan::new("Admin").remove_default_scope(SOFT_DELETE_SCOPE);
        let stmt = records(&schema, &plan);
        let text = stmt.to_string();
        assert!(text.contains("users.\"type\" = 'Admin'"), "{text}");
        assert!(!text.contains("deletedAt"), "{text}");

        let unscoped = records(&schema, &QueryPlan::new("Admin").remove_all_default_scopes());
        assert!(unscoped.filter.is_true());
        let sti = schema.model("Admin").unwrap();
        assert!(sti.scopes.contains(STI_SCOPE));
    }

    #[test]
    fn selected_scope_and_unknown_scope() {
        let schema = schema();
        let stmt = records(&schema, &QueryPlan::new("User").scope("named_bob"));
        assert!(stmt.to_string().contains("users.\"name\" = 'bob'"));
        let err = compile(&schema, &QueryPlan::new("User").scope("nope"), &Selection::Records)
            .unwrap_err();
        assert_eq!(err.definition_kind(), Some(DefinitionErrorKind::UnknownScope));
    }

    #[test]
    fn where_not_and_or_groups() {
        let schema = schema();
        let plan = QueryPlan::new("Post")
            .remove_all_default_scopes()
            .where_not(Filter::eq("title", "draft"))
            .where_any(vec![Filter::eq("userId", 1_i64), Filter::eq("userId", 2_i64)]);
        assert_eq!(
            records(&schema, &plan).filter.to_string(),
            "(posts.\"title\" <> 'draft' AND (posts.\"userId\" = 1 OR posts.\"userId\" = 2))"
        );
    }

    #[test]
    fn unknown_root_column_is_rejected() {
        let schema = schema();
        let err = compile(
            &schema,
            &QueryPlan::new("Post").filter(Filter::eq("nope", 1_i64)),
            &Selection::Records,
        )
        .unwrap_err();
        assert_eq!(err.definition_kind(), Some(DefinitionErrorKind::UnknownColumn));
    }

    #[test]
    fn has_many_join_applies_edge_scopes_and_order() {
        let schema = schema();
        let stmt = records(&schema, &QueryPlan::new("User").joins("posts"));
        assert_eq!(stmt.joins.len(), 1);
        let join = &stmt.joins[0];
        assert_eq!(join.table, "posts");
        assert_eq!(join.alias, "posts_1");
        assert_eq!(
            join.on.to_string(),
            "(users.\"id\" = posts_1.\"userId\" AND posts_1.\"deletedAt\" IS NULL)"
        );
        assert_eq!(stmt.order_by.len(), 1);
        assert_eq!(stmt.order_by[0].column, ColumnRef::new("posts_1", "createdAt"));
        assert_eq!(stmt.order_by[0].direction, OrderDirection::Desc);
    }

    #[test]
    fn through_join_expands_every_hop() {
        let schema = schema();
        let stmt = records(&schema, &QueryPlan::new("User").joins("comments"));
        let tables: Vec<&str> = stmt.joins.iter().map(|j| j.table.as_str()).collect();
        assert_eq!(tables, vec!["posts", "comments"]);
        assert!(stmt.joins[1]
            .on
            .to_string()
            .contains("posts_1.\"id\" = comments_2.\"postId\""));
    }

    #[test]
    fn shared_prefixes_join_once() {
        let schema = schema();
        let plan = QueryPlan::new("User").joins("posts").joins("posts.comments");
        let stmt = records(&schema, &plan);
        assert_eq!(stmt.joins.len(), 2);
    }

    #[test]
    fn without_default_scope_beats_plan_mode_on_its_edge() {
        let schema = schema();
        let plan = QueryPlan::new("User")
            .remove_all_default_scopes_except_on_associations()
            .joins("allPosts")
            .joins("posts");
        let stmt = records(&schema, &plan);
        assert!(stmt.filter.is_true());
        assert!(!stmt.joins[0].on.to_string().contains("deletedAt"));
        assert!(stmt.joins[1].on.to_string().contains("deletedAt"));

        let all = records(&schema, &QueryPlan::new("User").remove_all_default_scopes().joins("posts"));
        assert!(!all.joins[0].on.to_string().contains("deletedAt"));
    }

    #[test]
    fn polymorphic_has_many_pins_owner_type() {
        let schema = schema();
        let stmt = records(&schema, &QueryPlan::new("Admin").joins("images"));
        let on = stmt.joins[0].on.to_string();
        assert!(on.contains("images_1.\"imageableType\" = 'User'"), "{on}");
    }

    #[test]
    fn polymorphic_belongs_to_join_needs_narrowing() {
        let schema = schema();
        let err = compile(
            &schema,
            &QueryPlan::new("Comment").joins("commentable"),
            &Selection::Records,
        )
        .unwrap_err();
        assert_eq!(
            err.association_kind(),
            Some(AssociationErrorKind::CannotJoinPolymorphicBelongsTo)
        );

        let plan = QueryPlan::new("Comment").joins(
            JoinPath::new("commentable")
                .filter(Filter::eq("commentableType", "Post"))
                .filter(Filter::eq("title", "hello")),
        );
        let stmt = records(&schema, &plan);
        let join = &stmt.joins[0];
        assert_eq!(join.table, "posts");
        let on = join.on.to_string();
        assert!(on.contains("comments.\"commentableType\" = 'Post'"), "{on}");
        assert!(on.contains("comments.\"commentableId\" = commentable_1.\"id\""), "{on}");
        assert!(on.contains("commentable_1.\"title\" = 'hello'"), "{on}");

        let outside = QueryPlan::new("Comment")
            .joins(JoinPath::new("commentable").filter(Filter::eq("commentableType", "Image")));
        assert!(compile(&schema, &outside, &Selection::Records).is_err());
    }

    #[test]
    fn required_where_needs_a_hop_filter() {
        let schema = schema();
        let err = compile(
            &schema,
            &QueryPlan::new("Post").joins("translations"),
            &Selection::Records,
        )
        .unwrap_err();
        assert_eq!(
            err.association_kind(),
            Some(AssociationErrorKind::MissingRequiredAssociationWhereClause)
        );
        let plan = QueryPlan::new("Post")
            .joins(JoinPath::new("translations").filter(Filter::eq("locale", "fr")));
        let stmt = records(&schema, &plan);
        assert!(stmt.joins[0].on.to_string().contains("'fr'"));
    }

    #[test]
    fn required_filter_routes_to_the_hop_that_declares_it() {
        let schema = schema();
        let plan = QueryPlan::new("User").joins(
            JoinPath::new("localeComments")
                .filter(Filter::eq("locale", "de"))
                .filter(Filter::eq("body", "hi")),
        );
        let stmt = records(&schema, &plan);
        let bridge = stmt.joins[0].on.to_string();
        assert!(bridge.contains("localePosts_1.\"locale\" = 'de'"), "{bridge}");
        assert!(!bridge.contains("'hi'"), "{bridge}");
        let leaf = stmt.joins[1].on.to_string();
        assert!(leaf.contains("comments_2.\"body\" = 'hi'"), "{leaf}");

        let routed = route_filters(
            &resolve_path(&schema, "User", "localeComments").unwrap(),
            &[Filter::eq("locale", "de")],
            &[],
        );
        assert_eq!(routed[0].0, vec![Filter::eq("locale", "de")]);
        assert!(routed[1].0.is_empty());
    }

    #[test]
    fn through_scope_exemption_stays_on_the_source_edge() {
        let schema = schema();
        let stmt = records(&schema, &QueryPlan::new("User").joins("allPostComments"));
        assert!(stmt.joins[0].on.to_string().contains("deletedAt"));

        let anchored = QueryPlan::new("Comment").anchored(Anchor {
            owner: "User".into(),
            key: Value::BigInt(7),
            association: "allPostComments".into(),
            filters: Vec::new(),
        });
        let text = records(&schema, &anchored).to_string();
        assert!(text.contains("posts_1.\"deletedAt\" IS NULL"), "{text}");
    }

    #[test]
    fn passthrough_where_reads_plan_data() {
        let schema = schema();
        let err = compile(
            &schema,
            &QueryPlan::new("Post").joins("localized"),
            &Selection::Records,
        )
        .unwrap_err();
        assert_eq!(
            err.association_kind(),
            Some(AssociationErrorKind::MissingPassthroughData)
        );
        let plan = QueryPlan::new("Post").passthrough("locale", "de").joins("localized");
        let stmt = records(&schema, &plan);
        assert!(stmt.joins[0]
            .on
            .to_string()
            .contains("localized_1.\"locale\" = 'de'"));
    }

    #[test]
    fn projections() {
        let schema = schema();
        let plan = QueryPlan::new("Post").remove_all_default_scopes().order(Order::asc("title"));
        let count = compile(&schema, &plan, &Selection::Count).unwrap();
        assert_eq!(count.projection, Projection::Count);
        assert!(count.order_by.is_empty());

        let pluck = compile(&schema, &plan, &Selection::Pluck(vec!["title".into()])).unwrap();
        assert_eq!(
            pluck.projection,
            Projection::Columns(vec![ColumnRef::new("posts", "title")])
        );
        let max = compile(&schema, &plan, &Selection::Max("createdAt".into())).unwrap();
        assert_eq!(max.projection, Projection::Max(ColumnRef::new("posts", "createdAt")));
        let exists = compile(&schema, &plan, &Selection::Exists).unwrap();
        assert_eq!(exists.limit, Some(1));
        assert!(compile(&schema, &plan, &Selection::Min("nope".into())).is_err());
    }

    #[test]
    fn anchored_plan_uses_subquery_from_owner() {
        let schema = schema();
        let plan = QueryPlan::new("Comment").anchored(Anchor {
            owner: "User".into(),
            key: Value::BigInt(7),
            association: "comments".into(),
            filters: Vec::new(),
        });
        let stmt = records(&schema, &plan);
        let Expr::InSubquery { query, .. } = &stmt.filter else {
            panic!("expected subquery, got {}", stmt.filter);
        };
        assert_eq!(query.table, "users");
        assert_eq!(query.joins.len(), 2);
        assert_eq!(
            query.projection,
            Projection::Columns(vec![ColumnRef::new("comments_2", "id")])
        );
        assert_eq!(query.filter.to_string(), "anchor.\"id\" = 7");
    }

    #[test]
    fn preloads_do_not_affect_compilation() {
        let schema = schema();
        let plain = records(&schema, &QueryPlan::new("User"));
        let with = records(&schema, &QueryPlan::new("User").preload(PreloadTree::parse("posts")));
        assert_eq!(plain, with);
    }

    #[test]
    fn edge_statement_batches_keys() {
        let schema = schema();
        let path = resolve_path(&schema, "User", "posts").unwrap();
        let user = schema.model("User").unwrap();
        let post = schema.model("Post").unwrap();
        let stmt = edge_statement(
            &EdgeQuery {
                hop: &path.hops[0],
                owner: user,
                target: post,
                keys: vec![Value::BigInt(1), Value::BigInt(2)],
                filters: &[],
                filters_not: &[],
                skip_scopes: &[],
            },
            &QueryContext::default(),
        )
        .unwrap();
        assert_eq!(
            stmt.to_string(),
            "SELECT posts.* FROM \"posts\" AS posts WHERE (posts.\"userId\" IN (1, 2) AND posts.\"deletedAt\" IS NULL) ORDER BY posts.\"createdAt\" DESC"
        );
    }
}
