//! Query plans for relmodel.
//!
//! `relmodel-query` is the **plan construction layer**. It turns composable,
//! persistent [`QueryPlan`] values into abstract
//! [`SelectStatement`](relmodel_core::SelectStatement) trees.
//!
//! # Role In The Architecture
//!
//! - **Plans**: immutable, `Arc`-shared query descriptions with filters,
//!   ordering, joins, preloads, scope bypass and passthrough data.
//! - **Join compilation**: association joins expanded hop by hop, including
//!   through chains and polymorphic edges.
//! - **Edge queries**: the batch statements the preload hydrator issues.
//!
//! Plans execute through a `Session` in `relmodel-session`.

pub mod compile;
pub mod join;
pub mod plan;
pub mod preload;

pub use compile::{
    EdgeQuery, Selection, association_conditions, compile, edge_statement, route_filters,
    scope_conditions,
};
pub use join::{JoinPath, JoinSegment};
pub use plan::{Anchor, QueryContext, QueryPlan};
pub use preload::{PreloadNode, PreloadTree};
