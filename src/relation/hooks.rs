//! Observer functions fired by nested mutations.
//!
//! Hooks belong to a relation definition and fire for the rows the cascade writes through
//! that relation. Each hook runs once per underlying statement, synchronously, inside the
//! cascade's transaction. Before-create hooks receive the rows about to be inserted;
//! before-update and before-delete hooks receive the rows matched by the statement;
//! after hooks receive the rows the statement returned.

use std::fmt;
use std::sync::Arc;

use crate::executor::{LifeError, LifeExecutor, Record};
use crate::relation::RelationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

pub type Hook = Arc<dyn Fn(&[Record], &dyn LifeExecutor) -> Result<(), LifeError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    entries: Vec<(HookEvent, Hook)>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` for `event`. Hooks of the same event fire in registration order.
    pub fn on<F>(mut self, event: HookEvent, hook: F) -> Self
    where
        F: Fn(&[Record], &dyn LifeExecutor) -> Result<(), LifeError> + Send + Sync + 'static,
    {
        self.entries.push((event, Arc::new(hook)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has(&self, event: HookEvent) -> bool {
        self.entries.iter().any(|(e, _)| *e == event)
    }

    pub(crate) fn fire(
        &self,
        event: HookEvent,
        records: &[Record],
        executor: &dyn LifeExecutor,
    ) -> Result<(), RelationError> {
        for (_, hook) in self.entries.iter().filter(|(e, _)| *e == event) {
            hook(records, executor)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events: Vec<_> = self.entries.iter().map(|(e, _)| e).collect();
        f.debug_struct("Hooks").field("events", &events).finish()
    }
}
