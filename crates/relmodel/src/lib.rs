//! relmodel - an association graph compiler and batch-hydrating ORM core.
//!
//! relmodel describes relational models at runtime and answers three
//! questions about them:
//!
//! - **What does an association mean?** Foreign keys are inferred or
//!   validated when the schema is built, and through chains are flattened
//!   into concrete hops.
//! - **What SQL does a query need?** Persistent [`QueryPlan`]s compile into
//!   abstract statements with joins, scopes and association filters applied.
//! - **How do records get loaded?** Preloads hydrate whole association trees
//!   with one statement per edge and level, and persistence runs hooks,
//!   cascades and soft deletes in order.
//!
//! SQL rendering and transport belong to an [`Executor`] you provide.
//!
//! # Quick Start
//!
//! ```ignore
//! use relmodel::prelude::*;
//!
//! let schema = SchemaBuilder::new()
//!     .model(
//!         ModelBuilder::new("User")
//!             .column("name", "text")
//!             .association(AssociationDescriptor::has_many("posts", "Post")),
//!     )
//!     .model(
//!         ModelBuilder::new("Post")
//!             .column("userId", "bigint")
//!             .column("title", "text")
//!             .soft_delete()
//!             .association(AssociationDescriptor::belongs_to("user", "User")),
//!     )
//!     .build()?;
//!
//! let session = Session::new(schema, executor);
//!
//! async fn main_example<E: Executor>(cx: &Cx, session: &Session<E>) {
//!     let mut user = session.create(cx, "User", [("name", "ada")], None).await?;
//!     session
//!         .create_association(cx, &mut user, "posts", [("title", "hello")], None)
//!         .await?;
//!
//!     let users = session
//!         .query("User")
//!         .preload("posts")
//!         .all(cx)
//!         .await?;
//! }
//! ```

pub use relmodel_core::{
    AssociationDescriptor, AssociationErrorKind, AssociationKind, AssociationSlot,
    AttributeMarshaller, BinaryOp, BypassMode, ColumnRef, DefaultMarshaller, DefinitionErrorKind,
    DeleteStatement, Error, Executor, Expr, Filter, FilterOp, HookContext, HookEvent,
    InsertStatement, Introspect, JoinKind, ModelBuilder, ModelDef, NamingConfig, Order,
    OrderDirection, PersistenceErrorKind, Projection, QueryError, QueryErrorKind, QueryResult,
    Record, RecordCollection, Result, Row, SOFT_DELETE_SCOPE, STI_SCOPE, Schema, SchemaBuilder,
    ScopeBypass, ScopeDescriptor, SelectStatement, Statement, ThroughPath, TxnHandle,
    UpdateStatement, ValidationError, Value, resolve_path, try_outcome, try_result,
};

pub use relmodel_query::{
    Anchor, JoinPath, PreloadNode, PreloadTree, QueryContext, QueryPlan, Selection, compile,
};

pub use relmodel_session::{Query, Session, SessionConfig, Transaction, invalid};

pub use asupersync::{Cx, Outcome};

/// The types most programs need.
///
/// ```ignore
/// use relmodel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Schema definition
        AssociationDescriptor,
        HookEvent,
        ModelBuilder,
        SchemaBuilder,
        ScopeDescriptor,
        // Querying
        Filter,
        JoinPath,
        Order,
        PreloadNode,
        PreloadTree,
        QueryPlan,
        // Execution
        Error,
        Executor,
        Record,
        Result,
        Session,
        Transaction,
        Value,
    };
}
