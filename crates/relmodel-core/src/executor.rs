//! The executor contract.
//!
//! An [`Executor`] renders abstract [`Statement`]s for its dialect, runs
//! them, and owns the transaction primitive. relmodel only ever talks to the
//! store through this trait.

use crate::error::Error;
use crate::row::Row;
use crate::stmt::Statement;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// Opaque handle to a transaction opened by an [`Executor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnHandle(u64);

impl TxnHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Rows produced by a statement plus the number of rows it touched.
///
/// Selects fill `rows`; inserts return the stored row (generated primary
/// key and defaults included); updates and deletes report `rows_affected`.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            rows,
            rows_affected,
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    /// The first row, if any.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// The external SQL executor.
///
/// All methods take a [`Cx`] for cancellation and return an [`Outcome`].
/// A `txn` of `None` runs on the default (unscoped) connection.
pub trait Executor: Send + Sync {
    /// Run a statement, optionally inside a transaction.
    fn execute(
        &self,
        cx: &Cx,
        stmt: &Statement,
        txn: Option<TxnHandle>,
    ) -> impl Future<Output = Outcome<QueryResult, Error>> + Send;

    /// Open a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<TxnHandle, Error>> + Send;

    /// Commit a transaction.
    fn commit(&self, cx: &Cx, txn: TxnHandle) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back a transaction.
    fn rollback(&self, cx: &Cx, txn: TxnHandle)
    -> impl Future<Output = Outcome<(), Error>> + Send;
}
