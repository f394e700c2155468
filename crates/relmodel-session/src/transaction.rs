//! Transactions with deferred commit hooks.
//!
//! A [`Transaction`] wraps an executor [`TxnHandle`] together with the
//! `after_*_commit` hooks queued by operations that ran inside it. The
//! session fires the queue after a successful commit and drops it on
//! rollback.

use relmodel_core::{HookEvent, Record, Result, TxnHandle, run_hooks};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
struct Deferred {
    event: HookEvent,
    record: Record,
}

#[derive(Debug)]
struct TxnState {
    handle: TxnHandle,
    finalized: AtomicBool,
    deferred: Mutex<Vec<Deferred>>,
}

/// An open transaction.
///
/// Cheap to clone; clones share the same deferred-hook queue, so a
/// transaction can be moved into a closure and still be committed by the
/// session afterwards.
#[derive(Debug, Clone)]
pub struct Transaction {
    state: Arc<TxnState>,
}

impl Transaction {
    pub(crate) fn new(handle: TxnHandle) -> Self {
        Self {
            state: Arc::new(TxnState {
                handle,
                finalized: AtomicBool::new(false),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The executor handle.
    pub fn handle(&self) -> TxnHandle {
        self.state.handle
    }

    /// Whether the transaction was committed or rolled back.
    pub fn is_finalized(&self) -> bool {
        self.state.finalized.load(Ordering::Acquire)
    }

    /// Mark the transaction finished. Returns `false` if it already was.
    pub(crate) fn finalize(&self) -> bool {
        !self.state.finalized.swap(true, Ordering::AcqRel)
    }

    /// Queue a commit hook. The record is snapshotted as it is now.
    pub fn defer(&self, event: HookEvent, record: &Record) {
        let mut queue = self
            .state
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.push(Deferred {
            event,
            record: record.clone(),
        });
    }

    /// Number of hooks waiting for commit.
    pub fn pending_hooks(&self) -> usize {
        self.state
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn take_deferred(&self) -> Vec<Deferred> {
        std::mem::take(
            &mut *self
                .state
                .deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Fire every queued hook in queue order. Called after commit.
    pub(crate) fn run_deferred(&self) -> Result<()> {
        for mut deferred in self.take_deferred() {
            tracing::trace!(
                model = %deferred.record.model_name(),
                event = deferred.event.as_str(),
                "Running deferred commit hook"
            );
            run_hooks(deferred.event, &mut deferred.record, None)?;
        }
        Ok(())
    }

    /// Drop every queued hook. Called after rollback.
    pub(crate) fn discard_deferred(&self) -> usize {
        self.take_deferred().len()
    }
}

/// Fire a commit hook now, or queue it on `txn`.
pub(crate) fn commit_hook(
    event: HookEvent,
    record: &mut Record,
    txn: Option<&Transaction>,
) -> Result<()> {
    debug_assert!(event.is_commit());
    if !record.model().hooks.has(event) {
        return Ok(());
    }
    match txn {
        Some(txn) => {
            txn.defer(event, record);
            Ok(())
        }
        None => run_hooks(event, record, None).map(|_| ()),
    }
}
