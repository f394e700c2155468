//! Lifecycle hooks.
//!
//! Hooks are named callbacks registered per [`HookEvent`] on a model. The
//! persistence coordinator invokes them in registration order at fixed
//! points of create, update and destroy. `*Commit` events run after the
//! enclosing transaction commits, or immediately when there is none.

use crate::error::Result;
use crate::executor::TxnHandle;
use crate::record::Record;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeSave,
    AfterSave,
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDestroy,
    AfterDestroy,
    AfterCreateCommit,
    AfterUpdateCommit,
    AfterSaveCommit,
    AfterDestroyCommit,
}

impl HookEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            HookEvent::BeforeSave => "before_save",
            HookEvent::AfterSave => "after_save",
            HookEvent::BeforeCreate => "before_create",
            HookEvent::AfterCreate => "after_create",
            HookEvent::BeforeUpdate => "before_update",
            HookEvent::AfterUpdate => "after_update",
            HookEvent::BeforeDestroy => "before_destroy",
            HookEvent::AfterDestroy => "after_destroy",
            HookEvent::AfterCreateCommit => "after_create_commit",
            HookEvent::AfterUpdateCommit => "after_update_commit",
            HookEvent::AfterSaveCommit => "after_save_commit",
            HookEvent::AfterDestroyCommit => "after_destroy_commit",
        }
    }

    /// Whether this event is deferred until commit.
    pub const fn is_commit(self) -> bool {
        matches!(
            self,
            HookEvent::AfterCreateCommit
                | HookEvent::AfterUpdateCommit
                | HookEvent::AfterSaveCommit
                | HookEvent::AfterDestroyCommit
        )
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook sees.
pub struct HookContext<'a> {
    pub event: HookEvent,
    pub record: &'a mut Record,
    /// The active transaction, if any
    pub txn: Option<TxnHandle>,
    prevent_deletion: bool,
}

impl<'a> HookContext<'a> {
    pub fn new(event: HookEvent, record: &'a mut Record, txn: Option<TxnHandle>) -> Self {
        Self {
            event,
            record,
            txn,
            prevent_deletion: false,
        }
    }

    /// Keep the row when called from `before_destroy`. The surrounding
    /// transaction still commits.
    pub fn prevent_deletion(&mut self) {
        self.prevent_deletion = true;
    }

    pub fn deletion_prevented(&self) -> bool {
        self.prevent_deletion
    }
}

pub type HookFn = Arc<dyn Fn(&mut HookContext<'_>) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct Hook {
    pub name: String,
    pub event: HookEvent,
    callback: HookFn,
}

impl Hook {
    pub fn new<F>(event: HookEvent, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&mut HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            event,
            callback: Arc::new(callback),
        }
    }

    pub fn call(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        (self.callback)(ctx)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Per-model ordered hook lists.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Hook>,
}

impl HookRegistry {
    pub(crate) fn from_hooks(hooks: Vec<Hook>) -> Self {
        Self { hooks }
    }

    /// Hooks for `event`, in registration order.
    pub fn for_event(&self, event: HookEvent) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(move |h| h.event == event)
    }

    pub fn has(&self, event: HookEvent) -> bool {
        self.for_event(event).next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Run every hook registered for `event` on the record's model.
///
/// Stops at the first failing hook. Returns whether any hook called
/// [`HookContext::prevent_deletion`].
pub fn run_hooks(event: HookEvent, record: &mut Record, txn: Option<TxnHandle>) -> Result<bool> {
    let model = Arc::clone(record.model());
    let mut ctx = HookContext::new(event, record, txn);
    for hook in model.hooks.for_event(event) {
        tracing::trace!(
            model = %model.name,
            hook = %hook.name,
            event = event.as_str(),
            "Running hook"
        );
        hook.call(&mut ctx)?;
    }
    Ok(ctx.deletion_prevented())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_events() {
        assert!(HookEvent::AfterDestroyCommit.is_commit());
        assert!(!HookEvent::AfterDestroy.is_commit());
        assert_eq!(HookEvent::BeforeCreate.to_string(), "before_create");
    }

    #[test]
    fn registry_preserves_order() {
        let registry = HookRegistry::from_hooks(vec![
            Hook::new(HookEvent::BeforeSave, "first", |_| Ok(())),
            Hook::new(HookEvent::AfterSave, "other", |_| Ok(())),
            Hook::new(HookEvent::BeforeSave, "second", |_| Ok(())),
        ]);
        let names: Vec<&str> = registry
            .for_event(HookEvent::BeforeSave)
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(!registry.has(HookEvent::BeforeDestroy));
    }
}
