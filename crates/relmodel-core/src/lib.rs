//! Core types for relmodel.
//!
//! This crate holds everything that runs synchronously and in memory:
//!
//! - `Schema` / `ModelDef`: the validated registry of models, built once
//! - `AssociationRegistry` and `ScopeRegistry` per model
//! - foreign-key resolution at definition time, through-path resolution at
//!   query time
//! - `Record` instances with change tracking and association slots
//! - the abstract `Statement` tree and the `Executor` contract
//! - `Outcome` and `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod association;
pub mod error;
pub mod executor;
pub mod filter;
pub mod foreign_key;
pub mod hooks;
pub mod marshal;
pub mod naming;
pub mod record;
pub mod row;
pub mod schema;
pub mod scope;
pub mod stmt;
pub mod through;
pub mod value;

pub use association::{
    AssociationDescriptor, AssociationKind, AssociationRegistry, AssociationTarget,
    AssociationWhere, AssociationWhereValue, Dependent, SelfWhere,
};
pub use error::{
    AssociationError, AssociationErrorKind, DefinitionError, DefinitionErrorKind, Error,
    PersistenceError, PersistenceErrorKind, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind, TypeError, ValidationError,
};
pub use executor::{Executor, QueryResult, TxnHandle};
pub use filter::{Filter, FilterOp, Order};
pub use hooks::{Hook, HookContext, HookEvent, HookRegistry, run_hooks};
pub use marshal::{AttributeMarshaller, DefaultMarshaller};
pub use naming::NamingConfig;
pub use record::{AssociationSlot, Record, RecordCollection};
pub use row::{ColumnInfo, Row};
pub use schema::{ColumnDef, Introspect, ModelBuilder, ModelDef, Schema, SchemaBuilder, StiInfo};
pub use scope::{
    BypassMode, SOFT_DELETE_SCOPE, STI_SCOPE, ScopeBypass, ScopeDescriptor, ScopeRegistry,
};
pub use stmt::{
    BinaryOp, ColumnRef, DeleteStatement, Expr, InsertStatement, Join, JoinKind, OrderBy,
    OrderDirection, Projection, SelectStatement, Statement, UpdateStatement,
};
pub use through::{ThroughHop, ThroughPath, resolve_path};
pub use value::{Value, ValueKey};

/// Unwrap an `Outcome`, returning early from the enclosing `Outcome`
/// function on anything but `Ok`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result`, returning `Outcome::Err` from the enclosing `Outcome`
/// function on error.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return $crate::Outcome::Err(e.into()),
        }
    };
}
