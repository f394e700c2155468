//! Persistent query plans.
//!
//! A [`QueryPlan`] is an immutable description of a query rooted at one
//! model. Every combinator takes `&self` and returns a new plan; the
//! collections inside are `Arc`-shared and only copied when a fork actually
//! changes them, so a base plan can be extended in several directions
//! without the branches seeing each other's clauses.
//!
//! ```ignore
//! let visible = QueryPlan::new("Post").filter(Filter::eq("published", true));
//! let recent = visible.order(Order::desc("createdAt")).limit(10);
//! let with_authors = visible.preload("user");
//! ```

use crate::join::JoinPath;
use crate::preload::PreloadTree;
use relmodel_core::{Filter, Order, ScopeBypass, TxnHandle, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scope bypass, transaction and passthrough data threaded through every
/// statement issued on behalf of one plan, including preload queries.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub bypass: ScopeBypass,
    pub txn: Option<TxnHandle>,
    pub passthrough: Arc<BTreeMap<String, Value>>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(txn: Option<TxnHandle>) -> Self {
        Self {
            txn,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_bypass(mut self, bypass: ScopeBypass) -> Self {
        self.bypass = bypass;
        self
    }

    /// Bypass one more default scope by name.
    #[must_use]
    pub fn bypassing(mut self, scope: impl Into<String>) -> Self {
        self.bypass = self.bypass.with(scope);
        self
    }
}

/// Restricts a plan to the records reachable from one owner record through
/// one association.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub owner: String,
    /// Primary key of the owner record.
    pub key: Value,
    pub association: String,
    /// Hop filters on the association's leaf.
    pub filters: Vec<Filter>,
}

/// An immutable query description.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    model: String,
    alias: Option<String>,
    filters: Arc<Vec<Filter>>,
    filters_not: Arc<Vec<Filter>>,
    any: Arc<Vec<Vec<Filter>>>,
    order: Arc<Vec<Order>>,
    limit: Option<u64>,
    offset: Option<u64>,
    distinct: Option<String>,
    joins: Arc<Vec<JoinPath>>,
    preload: Arc<PreloadTree>,
    scopes: Arc<Vec<String>>,
    anchor: Option<Arc<Anchor>>,
    context: QueryContext,
}

impl QueryPlan {
    /// A plan returning every visible record of `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            alias: None,
            filters: Arc::default(),
            filters_not: Arc::default(),
            any: Arc::default(),
            order: Arc::default(),
            limit: None,
            offset: None,
            distinct: None,
            joins: Arc::default(),
            preload: Arc::default(),
            scopes: Arc::default(),
            anchor: None,
            context: QueryContext::default(),
        }
    }

    // ==================== Combinators ====================

    /// Add a where clause on the root model.
    #[must_use]
    pub fn filter(&self, filter: Filter) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.filters).push(filter);
        next
    }

    /// `column = value`
    #[must_use]
    pub fn where_eq(&self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    /// Add a negated where clause on the root model.
    #[must_use]
    pub fn where_not(&self, filter: Filter) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.filters_not).push(filter);
        next
    }

    /// Add an or-group: at least one of `filters` must hold.
    #[must_use]
    pub fn where_any(&self, filters: Vec<Filter>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.any).push(filters);
        next
    }

    #[must_use]
    pub fn order(&self, order: Order) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.order).push(order);
        next
    }

    /// Replace the ordering.
    #[must_use]
    pub fn reorder(&self, orders: Vec<Order>) -> Self {
        let mut next = self.clone();
        next.order = Arc::new(orders);
        next
    }

    #[must_use]
    pub fn limit(&self, n: u64) -> Self {
        let mut next = self.clone();
        next.limit = Some(n);
        next
    }

    #[must_use]
    pub fn offset(&self, n: u64) -> Self {
        let mut next = self.clone();
        next.offset = Some(n);
        next
    }

    /// Return one row per distinct value of `column`.
    #[must_use]
    pub fn distinct(&self, column: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.distinct = Some(column.into());
        next
    }

    /// Join an association path.
    #[must_use]
    pub fn joins(&self, path: impl Into<JoinPath>) -> Self {
        let path = path.into();
        if path.is_empty() {
            return self.clone();
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.joins).push(path);
        next
    }

    /// Preload associations after the query returns.
    #[must_use]
    pub fn preload(&self, tree: impl Into<PreloadTree>) -> Self {
        let mut next = self.clone();
        let merged = next.preload.as_ref().clone().merge(&tree.into());
        next.preload = Arc::new(merged);
        next
    }

    /// Supply a value for `Passthrough` association filters on `column`.
    #[must_use]
    pub fn passthrough(&self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.context.passthrough).insert(column.into(), value.into());
        next
    }

    /// Apply a named user scope.
    #[must_use]
    pub fn scope(&self, name: impl Into<String>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.scopes).push(name.into());
        next
    }

    /// Drop every default scope, on the root and on every association edge.
    #[must_use]
    pub fn remove_all_default_scopes(&self) -> Self {
        let mut next = self.clone();
        next.context.bypass = ScopeBypass {
            named: next.context.bypass.named.clone(),
            ..ScopeBypass::all()
        };
        next
    }

    /// Drop the root model's default scopes; association edges keep theirs.
    #[must_use]
    pub fn remove_all_default_scopes_except_on_associations(&self) -> Self {
        let mut next = self.clone();
        next.context.bypass = ScopeBypass {
            named: next.context.bypass.named.clone(),
            ..ScopeBypass::all_except_on_associations()
        };
        next
    }

    /// Drop one default scope by name, everywhere in the plan.
    #[must_use]
    pub fn remove_default_scope(&self, name: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.context.bypass = next.context.bypass.clone().with(name);
        next
    }

    /// Run every statement of this plan inside `txn`.
    #[must_use]
    pub fn in_transaction(&self, txn: Option<TxnHandle>) -> Self {
        let mut next = self.clone();
        next.context.txn = txn;
        next
    }

    /// Alias the root table in compiled statements.
    #[must_use]
    pub fn alias(&self, alias: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.alias = Some(alias.into());
        next
    }

    /// Restrict the plan to records reachable from one owner record.
    #[must_use]
    pub fn anchored(&self, anchor: Anchor) -> Self {
        let mut next = self.clone();
        next.anchor = Some(Arc::new(anchor));
        next
    }

    /// Replace the whole execution context.
    #[must_use]
    pub fn with_context(&self, context: QueryContext) -> Self {
        let mut next = self.clone();
        next.context = context;
        next
    }

    // ==================== Accessors ====================

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn alias_name(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn filters_not(&self) -> &[Filter] {
        &self.filters_not
    }

    pub fn any_groups(&self) -> &[Vec<Filter>] {
        &self.any
    }

    pub fn orders(&self) -> &[Order] {
        &self.order
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset_value(&self) -> Option<u64> {
        self.offset
    }

    pub fn distinct_column(&self) -> Option<&str> {
        self.distinct.as_deref()
    }

    pub fn join_paths(&self) -> &[JoinPath] {
        &self.joins
    }

    pub fn preloads(&self) -> &PreloadTree {
        &self.preload
    }

    pub fn selected_scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn anchor(&self) -> Option<&Anchor> {
        self.anchor.as_deref()
    }

    pub fn context(&self) -> &QueryContext {
        &self.context
    }

    pub fn bypass(&self) -> &ScopeBypass {
        &self.context.bypass
    }

    pub fn txn(&self) -> Option<TxnHandle> {
        self.context.txn
    }

    pub fn passthrough_value(&self, column: &str) -> Option<&Value> {
        self.context.passthrough.get(column)
    }
}
