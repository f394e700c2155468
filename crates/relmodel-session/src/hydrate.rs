//! Batch preload hydration.
//!
//! Preloading walks a [`PreloadTree`] breadth-first. At every level each
//! association is fetched with one statement per owning model and concrete
//! target type, no matter how many owner records are in the batch; a level
//! is complete before any of its nested levels is issued.
//!
//! A through association is loaded as its parts: the intermediate
//! association onto the owners, then the source association onto the
//! intermediates. An N-hop association costs at most N statements per level
//! and fills the intermediate slots on the way; parts that are already
//! loaded cost nothing.

use crate::{BoxFuture, Session, Transaction};
use asupersync::{Cx, Outcome};
use relmodel_core::record::owner_key;
use relmodel_core::{
    AssociationDescriptor, AssociationErrorKind, AssociationKind, AssociationSlot,
    AssociationWhereValue, Error, Executor, Filter, FilterOp, ModelDef, OrderDirection, Record,
    RecordCollection, Result, ThroughHop, ThroughPath, Value, ValueKey, resolve_path, try_outcome,
    try_result,
};
use relmodel_query::{
    EdgeQuery, PreloadNode, PreloadTree, QueryContext, edge_statement, route_filters,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Owner position in the batch, and one record reached from it.
type Reached = (usize, Record);

impl<E: Executor> Session<E> {
    /// Preload `tree` onto `records`.
    ///
    /// The set may mix models and may already be partially hydrated: records
    /// whose model lacks an association are skipped, loaded slots are kept
    /// as they are, and nested levels still descend into them.
    pub async fn load(
        &self,
        cx: &Cx,
        records: &mut [Record],
        tree: impl Into<PreloadTree>,
        txn: Option<&Transaction>,
    ) -> Outcome<(), Error> {
        let tree = tree.into();
        let ctx = QueryContext::in_transaction(txn.map(Transaction::handle));
        self.load_with_context(cx, records, &tree, &ctx).await
    }

    /// Preload with an explicit context (scope bypass and passthrough data
    /// of the plan that produced `records`).
    pub(crate) async fn load_with_context(
        &self,
        cx: &Cx,
        records: &mut [Record],
        tree: &PreloadTree,
        ctx: &QueryContext,
    ) -> Outcome<(), Error> {
        if tree.is_empty() || records.is_empty() {
            return Outcome::Ok(());
        }
        let depth = tree.depth();
        if depth > self.config().max_preload_depth {
            return Outcome::Err(Error::Custom(format!(
                "preload tree is {} levels deep; the session allows {}",
                depth,
                self.config().max_preload_depth
            )));
        }
        let roots: Vec<&mut Record> = records.iter_mut().collect();
        self.preload_level(cx, roots, tree, ctx, 0).await
    }

    fn preload_level<'a>(
        &'a self,
        cx: &'a Cx,
        mut records: Vec<&'a mut Record>,
        tree: &'a PreloadTree,
        ctx: &'a QueryContext,
        level: usize,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            let Some(first_model) = records.first().map(|r| Arc::clone(r.model())) else {
                return Outcome::Ok(());
            };

            for node in tree.nodes() {
                let name = node.association.as_str();
                let mut declared = false;
                let mut groups: Vec<(Arc<ModelDef>, Vec<&mut Record>)> = Vec::new();
                for record in records.iter_mut() {
                    if !record.model().associations.contains(name) {
                        continue;
                    }
                    declared = true;
                    if record.is_loaded(name) {
                        continue;
                    }
                    let model = Arc::clone(record.model());
                    match groups.iter_mut().find(|(m, _)| m.name == model.name) {
                        Some((_, members)) => members.push(&mut **record),
                        None => groups.push((model, vec![&mut **record])),
                    }
                }
                if !declared {
                    // No record in the batch declares it: surface the lookup error.
                    if let Err(e) = first_model.association(name) {
                        return Outcome::Err(e);
                    }
                }

                for (model, owners) in groups {
                    let path = try_result!(resolve_path(self.schema(), &model.name, name));
                    let batch_size = owners.len();
                    if path.bridge.is_some() {
                        try_outcome!(
                            self.preload_through(cx, owners, path, node, ctx, level)
                                .await
                        );
                    } else {
                        try_outcome!(self.preload_direct(cx, owners, &path, node, ctx).await);
                    }
                    tracing::debug!(
                        model = %model.name,
                        association = name,
                        batch_size,
                        level,
                        "Preloaded association"
                    );
                }
            }

            for node in tree.nodes() {
                if node.nested.is_empty() {
                    continue;
                }
                let children: Vec<&mut Record> = records
                    .iter_mut()
                    .filter_map(|record| record.association_mut(&node.association))
                    .flat_map(AssociationSlot::records_mut)
                    .collect();
                try_outcome!(
                    self.preload_level(cx, children, &node.nested, ctx, level + 1)
                        .await
                );
            }
            Outcome::Ok(())
        })
    }

    /// One concrete association: a single batched edge.
    async fn preload_direct(
        &self,
        cx: &Cx,
        owners: Vec<&mut Record>,
        path: &ThroughPath,
        node: &PreloadNode,
        ctx: &QueryContext,
    ) -> Outcome<(), Error> {
        let descriptor = try_result!(self.schema().association(&path.owner, &path.name));
        let reached = {
            let sources: Vec<(usize, &Record)> =
                owners.iter().enumerate().map(|(i, r)| (i, &**r)).collect();
            try_outcome!(self.fetch_hop(cx, path.leaf(), &sources, node, ctx).await)
        };
        let mut per_owner: Vec<Vec<Record>> = vec![Vec::new(); owners.len()];
        for (owner, record) in reached {
            per_owner[owner].push(record);
        }
        fill_slots(owners, &descriptor, per_owner);
        Outcome::Ok(())
    }

    /// A through association, loaded as its parts.
    ///
    /// The intermediate association is preloaded onto the owners and the
    /// source association onto the intermediates, each as a regular level,
    /// so slots that are already loaded are reused and nested through
    /// chains recurse. The leaves are then gathered per owner. A part whose
    /// node narrows its targets is loaded on detached copies: records only
    /// ever hold an association's own targets.
    fn preload_through<'a>(
        &'a self,
        cx: &'a Cx,
        mut owners: Vec<&'a mut Record>,
        path: ThroughPath,
        node: &'a PreloadNode,
        ctx: &'a QueryContext,
        level: usize,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            let descriptor = try_result!(self.schema().association(&path.owner, &path.name));
            let (Some(through), Some((bridge_len, source))) =
                (descriptor.through.clone(), path.bridge.clone())
            else {
                return Outcome::Err(Error::association(
                    AssociationErrorKind::MissingThroughAssociation,
                    path.owner.as_str(),
                    path.name.as_str(),
                    "not a through association",
                ));
            };
            let (bridge_node, source_node) =
                split_through_node(&path, bridge_len, &through, &source, node, &descriptor);

            let owner_count = owners.len();
            let detach_bridge = bridge_node.has_filters();
            let mut detached: Vec<Record> = if detach_bridge {
                owners.iter().map(|o| detached_copy(o, &through)).collect()
            } else {
                Vec::new()
            };
            let mut holders: Vec<&mut Record> = if detach_bridge {
                detached.iter_mut().collect()
            } else {
                owners.iter_mut().map(|o| &mut **o).collect()
            };
            let bridge_tree = PreloadTree::from(bridge_node);
            let bridge_holders: Vec<&mut Record> = holders.iter_mut().map(|h| &mut **h).collect();
            try_outcome!(
                self.preload_level(cx, bridge_holders, &bridge_tree, ctx, level)
                    .await
            );

            let detach_sources = source_node.has_filters();
            let source_tree = PreloadTree::from(source_node);
            let mut detached_mids: Vec<(usize, Record)> = Vec::new();
            let mids: Vec<&mut Record> = if detach_sources {
                for (i, holder) in holders.iter().enumerate() {
                    if let Ok(slot) = holder.association(&through) {
                        for mid in slot.records() {
                            detached_mids.push((i, detached_copy(mid, &source)));
                        }
                    }
                }
                detached_mids.iter_mut().map(|(_, mid)| mid).collect()
            } else {
                holders
                    .iter_mut()
                    .filter_map(|h| h.association_mut(&through))
                    .flat_map(AssociationSlot::records_mut)
                    .collect()
            };
            try_outcome!(self.preload_level(cx, mids, &source_tree, ctx, level).await);

            let mut per_owner: Vec<Vec<Record>> = vec![Vec::new(); owner_count];
            let mut seen: Vec<HashSet<ValueKey>> = vec![HashSet::new(); owner_count];
            let mut reach = |owner: usize, mid: &Record| {
                let Ok(slot) = mid.association(&source) else {
                    return;
                };
                // A through chain can reach one leaf along several paths.
                for leaf in slot.records() {
                    if seen[owner].insert(leaf.id().key()) {
                        per_owner[owner].push(leaf.clone());
                    }
                }
            };
            if detach_sources {
                for (owner, mid) in &detached_mids {
                    reach(*owner, mid);
                }
            } else {
                for (owner, holder) in holders.iter().enumerate() {
                    if let Ok(slot) = holder.association(&through) {
                        for mid in slot.records() {
                            reach(owner, mid);
                        }
                    }
                }
            }

            for targets in &mut per_owner {
                try_result!(apply_through_descriptor(&path.owner, &descriptor, targets, node, ctx));
            }
            fill_slots(owners, &descriptor, per_owner);
            Outcome::Ok(())
        })
    }

    /// One batched edge: every source's targets through `hop`.
    async fn fetch_hop(
        &self,
        cx: &Cx,
        hop: &ThroughHop,
        sources: &[(usize, &Record)],
        node: &PreloadNode,
        ctx: &QueryContext,
    ) -> Outcome<Vec<Reached>, Error> {
        let assoc = &hop.association;
        let Some((_, first)) = sources.first() else {
            return Outcome::Ok(Vec::new());
        };
        let owner_model = Arc::clone(first.model());

        let (groups, target_filters) = try_result!(partition_targets(assoc, sources, &node.filters));
        let mut reached = Vec::new();
        let mut statements = 0usize;
        for (type_name, members) in groups {
            let mut keys = Vec::new();
            let mut distinct_keys = HashSet::new();
            for &m in &members {
                let key = owner_key(sources[m].1, assoc);
                if !key.is_null() && distinct_keys.insert(key.key()) {
                    keys.push(key.clone());
                }
            }
            if keys.is_empty() {
                continue;
            }

            let target = Arc::clone(try_result!(self.schema().model(&type_name)));
            let stmt = try_result!(edge_statement(
                &EdgeQuery {
                    hop,
                    owner: &owner_model,
                    target: &target,
                    keys,
                    filters: &target_filters,
                    filters_not: &node.filters_not,
                    skip_scopes: &node.without_default_scopes,
                },
                ctx,
            ));
            let result = try_outcome!(self.execute(cx, stmt.into(), ctx.txn).await);
            statements += 1;

            let mut fetched = Vec::with_capacity(result.rows.len());
            for row in &result.rows {
                fetched.push(try_result!(self.hydrate_row(&target, row)));
            }
            let key_column = assoc.target_column(&target.primary_key);
            let mut index: HashMap<ValueKey, Vec<usize>> = HashMap::new();
            for (i, record) in fetched.iter().enumerate() {
                if let Some(value) = record.get(key_column) {
                    index.entry(value.key()).or_default().push(i);
                }
            }

            for &m in &members {
                let (owner, source) = sources[m];
                let Some(hits) = index.get(&owner_key(source, assoc).key()) else {
                    continue;
                };
                for &hit in hits {
                    if self_where_holds(assoc, source, &fetched[hit]) {
                        reached.push((owner, fetched[hit].clone()));
                    }
                }
            }
        }

        tracing::trace!(
            owner = %hop.owner,
            association = %assoc.name,
            sources = sources.len(),
            query_count = statements,
            reached = reached.len(),
            "Fetched association edge"
        );
        Outcome::Ok(reached)
    }
}

type TargetGroups = Vec<(String, Vec<usize>)>;

/// Split sources by concrete target type.
///
/// Polymorphic BelongsTo sources are grouped by their discriminator value;
/// a hop filter on the discriminator narrows the sources instead of the
/// targets. Everything else has one target model.
fn partition_targets(
    assoc: &AssociationDescriptor,
    sources: &[(usize, &Record)],
    filters: &[Filter],
) -> Result<(TargetGroups, Vec<Filter>)> {
    if !assoc.is_polymorphic_belongs_to() {
        let target = assoc.target_model()?.to_string();
        return Ok((
            vec![(target, (0..sources.len()).collect())],
            filters.to_vec(),
        ));
    }

    let discriminator = assoc.discriminator_column().unwrap_or_default();
    let (narrowing, target_filters): (Vec<Filter>, Vec<Filter>) = filters
        .iter()
        .cloned()
        .partition(|f| f.column == discriminator);
    let mut groups: TargetGroups = Vec::new();
    for (i, (_, source)) in sources.iter().enumerate() {
        let Some(value) = source.get(discriminator) else {
            continue;
        };
        if !narrowing.iter().all(|f| f.op.matches(value)) {
            continue;
        }
        let Some(type_name) = value.as_str() else {
            continue;
        };
        if !assoc.target.candidates().iter().any(|c| c == type_name) {
            tracing::trace!(
                association = %assoc.name,
                type_name,
                "Skipping record with unknown polymorphic type"
            );
            continue;
        }
        match groups.iter_mut().find(|(name, _)| name == type_name) {
            Some((_, members)) => members.push(i),
            None => groups.push((type_name.to_string(), vec![i])),
        }
    }
    Ok((groups, target_filters))
}

fn self_where_holds(assoc: &AssociationDescriptor, owner: &Record, target: &Record) -> bool {
    let pair = |target_column: &str, owner_column: &str| {
        let t = target.get(target_column).unwrap_or(&Value::Null);
        let o = owner.get(owner_column).unwrap_or(&Value::Null);
        (t, o)
    };
    assoc.self_where.iter().all(|sw| {
        let (t, o) = pair(&sw.target_column, &sw.owner_column);
        !t.is_null() && t.key() == o.key()
    }) && assoc.self_where_not.iter().all(|sw| {
        let (t, o) = pair(&sw.target_column, &sw.owner_column);
        !t.is_null() && !o.is_null() && t.key() != o.key()
    })
}

/// A through association's own filters and order, applied to its leaves.
fn apply_through_descriptor(
    owner: &str,
    descriptor: &AssociationDescriptor,
    targets: &mut Vec<Record>,
    node: &PreloadNode,
    ctx: &QueryContext,
) -> Result<()> {
    for (clauses, negated) in [(&descriptor.where_, false), (&descriptor.where_not, true)] {
        for clause in clauses {
            let op = match &clause.value {
                AssociationWhereValue::Filter(op) => op.clone(),
                AssociationWhereValue::Passthrough => match ctx.passthrough.get(&clause.column) {
                    Some(value) => FilterOp::Eq(value.clone()),
                    None => {
                        return Err(Error::association(
                            AssociationErrorKind::MissingPassthroughData,
                            owner,
                            descriptor.name.as_str(),
                            format!(
                                "'{}' needs passthrough data for '{}'",
                                descriptor.name, clause.column
                            ),
                        ));
                    }
                },
                AssociationWhereValue::Required => {
                    let satisfied = node
                        .filters
                        .iter()
                        .chain(&node.filters_not)
                        .any(|f| f.column == clause.column);
                    if !satisfied {
                        return Err(Error::association(
                            AssociationErrorKind::MissingRequiredAssociationWhereClause,
                            owner,
                            descriptor.name.as_str(),
                            format!(
                                "'{}' requires a filter on '{}'",
                                descriptor.name, clause.column
                            ),
                        ));
                    }
                    continue;
                }
            };
            targets.retain(|r| {
                let value = r.get(&clause.column).unwrap_or(&Value::Null);
                op.matches(value) != negated
            });
        }
    }

    if !descriptor.order.is_empty() {
        targets.sort_by(|a, b| {
            for order in &descriptor.order {
                let left = a.get(&order.column).unwrap_or(&Value::Null);
                let right = b.get(&order.column).unwrap_or(&Value::Null);
                let cmp = match order.direction {
                    OrderDirection::Asc => left.sort_cmp(right),
                    OrderDirection::Desc => right.sort_cmp(left),
                };
                if cmp.is_ne() {
                    return cmp;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
    Ok(())
}

/// Split a through node into its intermediate and source parts.
///
/// Caller filters are routed per hop the way joins route them. Scope
/// exemptions on the through edge apply where it ends, on the source.
fn split_through_node(
    path: &ThroughPath,
    bridge_len: usize,
    through: &str,
    source: &str,
    node: &PreloadNode,
    descriptor: &AssociationDescriptor,
) -> (PreloadNode, PreloadNode) {
    let mut bridge = PreloadNode::new(through);
    let mut leaf = PreloadNode::new(source);
    let routed = route_filters(path, &node.filters, &node.filters_not);
    for (hop, (filters, filters_not)) in routed.into_iter().enumerate() {
        let part = if hop < bridge_len { &mut bridge } else { &mut leaf };
        part.filters.extend(filters);
        part.filters_not.extend(filters_not);
    }
    for scope in node
        .without_default_scopes
        .iter()
        .chain(&descriptor.without_default_scopes)
    {
        if !leaf.without_default_scopes.contains(scope) {
            leaf.without_default_scopes.push(scope.clone());
        }
    }
    (bridge, leaf)
}

/// A copy of `record` with `association` unloaded.
fn detached_copy(record: &Record, association: &str) -> Record {
    let mut copy = record.clone();
    copy.unload(association);
    copy
}

/// Apply `distinct` and store each owner's targets.
fn fill_slots(
    owners: Vec<&mut Record>,
    descriptor: &AssociationDescriptor,
    mut per_owner: Vec<Vec<Record>>,
) {
    if let Some(column) = &descriptor.distinct {
        for targets in &mut per_owner {
            let mut values = HashSet::new();
            targets.retain(|r| values.insert(r.get(column).cloned().unwrap_or(Value::Null).key()));
        }
    }
    let collection = descriptor.kind == AssociationKind::HasMany;
    for (owner, targets) in owners.into_iter().zip(per_owner) {
        owner.set_association(
            descriptor.name.as_str(),
            slot_for(&descriptor.name, collection, targets),
        );
    }
}

/// The loaded slot for one owner.
fn slot_for(name: &str, collection: bool, mut targets: Vec<Record>) -> AssociationSlot {
    if collection {
        let mut loaded = RecordCollection::from_records(name, targets);
        loaded.freeze();
        return AssociationSlot::Many(loaded);
    }
    if targets.is_empty() {
        AssociationSlot::Empty
    } else {
        AssociationSlot::One(Box::new(targets.swap_remove(0)))
    }
}
