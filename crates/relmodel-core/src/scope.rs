//! Named scopes and scope bypass.
//!
//! A scope is a set of filters attached to a model. Default scopes apply to
//! every query against the model (and to every association edge that lands
//! on it) unless bypassed; other scopes apply only when a plan selects them.

use crate::association::AssociationDescriptor;
use crate::filter::Filter;
use std::collections::BTreeSet;

/// Name of the built-in soft-delete scope (`deletedAt IS NULL`).
pub const SOFT_DELETE_SCOPE: &str = "soft_delete";

/// Name of the built-in single-table-inheritance scope (`type = <child>`).
pub const STI_SCOPE: &str = "sti";

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeDescriptor {
    pub name: String,
    pub is_default: bool,
    pub filters: Vec<Filter>,
    pub filters_not: Vec<Filter>,
}

impl ScopeDescriptor {
    /// A scope applied unless bypassed.
    pub fn default_scope(name: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            name: name.into(),
            is_default: true,
            filters,
            filters_not: Vec::new(),
        }
    }

    /// A scope applied only when selected.
    pub fn named(name: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            name: name.into(),
            is_default: false,
            filters,
            filters_not: Vec::new(),
        }
    }

    pub fn where_not(mut self, filter: Filter) -> Self {
        self.filters_not.push(filter);
        self
    }
}

/// Per-model table of scopes.
#[derive(Debug, Clone, Default)]
pub struct ScopeRegistry {
    scopes: Vec<ScopeDescriptor>,
}

impl ScopeRegistry {
    pub(crate) fn from_scopes(scopes: Vec<ScopeDescriptor>) -> Self {
        Self { scopes }
    }

    pub fn get(&self, name: &str) -> Option<&ScopeDescriptor> {
        self.scopes.iter().find(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn defaults(&self) -> impl Iterator<Item = &ScopeDescriptor> {
        self.scopes.iter().filter(|s| s.is_default)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScopeDescriptor> {
        self.scopes.iter()
    }
}

/// How much of the default-scope set a plan switches off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BypassMode {
    #[default]
    None,
    /// No default scope applies anywhere in the plan.
    All,
    /// The root model is unscoped; association edges keep their scopes.
    AllExceptOnAssociations,
}

/// The scope-bypass state carried by a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeBypass {
    pub mode: BypassMode,
    /// Default scopes bypassed by name, on the root and on every edge.
    pub named: BTreeSet<String>,
}

impl ScopeBypass {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            mode: BypassMode::All,
            named: BTreeSet::new(),
        }
    }

    pub fn all_except_on_associations() -> Self {
        Self {
            mode: BypassMode::AllExceptOnAssociations,
            named: BTreeSet::new(),
        }
    }

    /// Bypass one default scope by name.
    pub fn with(mut self, scope: impl Into<String>) -> Self {
        self.named.insert(scope.into());
        self
    }

    /// Default scopes that apply to the root model of a plan.
    pub fn root_scopes<'a>(&self, scopes: &'a ScopeRegistry) -> Vec<&'a ScopeDescriptor> {
        match self.mode {
            BypassMode::All | BypassMode::AllExceptOnAssociations => Vec::new(),
            BypassMode::None => scopes
                .defaults()
                .filter(|s| !self.named.contains(&s.name))
                .collect(),
        }
    }

    /// Default scopes of `target` that apply when traversing `association`.
    ///
    /// Scopes named in the edge's `without_default_scopes` are skipped for
    /// this edge only, whatever the plan-wide mode.
    pub fn edge_scopes<'a>(
        &self,
        scopes: &'a ScopeRegistry,
        association: &AssociationDescriptor,
    ) -> Vec<&'a ScopeDescriptor> {
        if self.mode == BypassMode::All {
            return Vec::new();
        }
        scopes
            .defaults()
            .filter(|s| !self.named.contains(&s.name))
            .filter(|s| !association.without_default_scopes.contains(&s.name))
            .collect()
    }
}
