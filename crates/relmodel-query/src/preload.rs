//! Preload trees.
//!
//! A [`PreloadTree`] names the associations to batch-load after a query
//! returns, and what to load beneath each of them.
//!
//! # Example
//!
//! ```ignore
//! let tree = PreloadTree::new()
//!     .include("posts.comments")
//!     .include("team");
//! ```

use relmodel_core::Filter;

/// One association to preload, plus its nested preloads.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadNode {
    /// Association name on the parent model.
    pub association: String,
    /// Extra filters applied to the association's targets.
    ///
    /// These also satisfy `Required` association filters.
    pub filters: Vec<Filter>,
    /// Filters applied negated.
    pub filters_not: Vec<Filter>,
    /// Target default scopes not applied on this edge.
    pub without_default_scopes: Vec<String>,
    pub nested: PreloadTree,
}

impl PreloadNode {
    #[must_use]
    pub fn new(association: impl Into<String>) -> Self {
        Self {
            association: association.into(),
            filters: Vec::new(),
            filters_not: Vec::new(),
            without_default_scopes: Vec::new(),
            nested: PreloadTree::new(),
        }
    }

    /// Add a filter on the association's targets.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn filter_not(mut self, filter: Filter) -> Self {
        self.filters_not.push(filter);
        self
    }

    #[must_use]
    pub fn without_default_scope(mut self, scope: impl Into<String>) -> Self {
        self.without_default_scopes.push(scope.into());
        self
    }

    /// Add a nested preload under this node.
    #[must_use]
    pub fn nest(mut self, node: PreloadNode) -> Self {
        self.nested = self.nested.with(node);
        self
    }

    /// Whether this node's targets differ from the association's own.
    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
            || !self.filters_not.is_empty()
            || !self.without_default_scopes.is_empty()
    }
}

/// A tree of associations to preload.
///
/// Sibling nodes are unique by association name: adding a node that already
/// exists merges its children into the existing one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreloadTree {
    nodes: Vec<PreloadNode>,
}

impl PreloadTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a dotted path such as `"posts.comments.author"`.
    ///
    /// Empty segments are skipped; an empty path yields an empty tree.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        let parts: Vec<&str> = path
            .trim()
            .split('.')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        match build_nested(&parts) {
            Some(node) => Self { nodes: vec![node] },
            None => Self::new(),
        }
    }

    /// Include a dotted association path.
    #[must_use]
    pub fn include(self, path: &str) -> Self {
        self.merge(&Self::parse(path))
    }

    /// Include a node, merging with an existing sibling of the same name.
    #[must_use]
    pub fn with(mut self, node: PreloadNode) -> Self {
        self.insert(node);
        self
    }

    /// Union of two trees.
    #[must_use]
    pub fn merge(mut self, other: &PreloadTree) -> Self {
        for node in &other.nodes {
            self.insert(node.clone());
        }
        self
    }

    fn insert(&mut self, node: PreloadNode) {
        if let Some(existing) = self
            .nodes
            .iter_mut()
            .find(|n| n.association == node.association)
        {
            existing.filters.extend(node.filters);
            existing.filters_not.extend(node.filters_not);
            for scope in node.without_default_scopes {
                if !existing.without_default_scopes.contains(&scope) {
                    existing.without_default_scopes.push(scope);
                }
            }
            let nested = std::mem::take(&mut existing.nested);
            existing.nested = nested.merge(&node.nested);
        } else {
            self.nodes.push(node);
        }
    }

    pub fn nodes(&self) -> &[PreloadNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Length of the longest path in the tree.
    pub fn depth(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| 1 + n.nested.depth())
            .max()
            .unwrap_or(0)
    }
}

impl From<&str> for PreloadTree {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

impl From<PreloadNode> for PreloadTree {
    fn from(node: PreloadNode) -> Self {
        Self::new().with(node)
    }
}

fn build_nested(parts: &[&str]) -> Option<PreloadNode> {
    let (first, rest) = parts.split_first()?;
    let mut node = PreloadNode::new(*first);
    if let Some(child) = build_nested(rest) {
        node.nested = PreloadTree { nodes: vec![child] };
    }
    Some(node)
}
