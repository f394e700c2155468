//! Association join paths.

use relmodel_core::Filter;

/// One association step of a join path.
///
/// `filters` apply to the step's target, with one exception: on a
/// polymorphic BelongsTo, a filter on the discriminator column narrows the
/// edge to a single target type and applies to the owner side instead.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSegment {
    pub association: String,
    pub filters: Vec<Filter>,
    pub filters_not: Vec<Filter>,
}

impl JoinSegment {
    pub fn new(association: impl Into<String>) -> Self {
        Self {
            association: association.into(),
            filters: Vec::new(),
            filters_not: Vec::new(),
        }
    }

    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty() || !self.filters_not.is_empty()
    }
}

/// A chain of associations to join from the plan's root model, with hop
/// filters interleaved.
///
/// ```ignore
/// JoinPath::new("posts")
///     .filter(Filter::eq("published", true))
///     .then("comments");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinPath {
    segments: Vec<JoinSegment>,
}

impl JoinPath {
    /// Start a path at `association` on the plan's root model.
    #[must_use]
    pub fn new(association: impl Into<String>) -> Self {
        Self {
            segments: vec![JoinSegment::new(association)],
        }
    }

    /// Parse a dotted path such as `"posts.comments"`.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('.')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(JoinSegment::new)
                .collect(),
        }
    }

    /// Continue the path through `association` on the previous step's target.
    #[must_use]
    pub fn then(mut self, association: impl Into<String>) -> Self {
        self.segments.push(JoinSegment::new(association));
        self
    }

    /// Filter the last step's target.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        if let Some(last) = self.segments.last_mut() {
            last.filters.push(filter);
        }
        self
    }

    /// Filter the last step's target, negated.
    #[must_use]
    pub fn filter_not(mut self, filter: Filter) -> Self {
        if let Some(last) = self.segments.last_mut() {
            last.filters_not.push(filter);
        }
        self
    }

    pub fn segments(&self) -> &[JoinSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl From<&str> for JoinPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}
