//! Concurrent table of attached handle contexts.
//!
//! Attach is keep-if-exists. Release and delete remove the entry and hand the
//! context to the [`Finalizer`]; removal from the map decides the single
//! winner, so finalization happens exactly once per attached context.

use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::context::{ContextKey, ContextState, HandleContext};

pub type SharedContext = Arc<Mutex<HandleContext>>;

/// Invoked once for each context leaving the table.
pub trait Finalizer: Send + Sync {
    fn finalize(&self, key: ContextKey, ctx: HandleContext);
}

#[derive(Debug, Clone)]
pub enum AttachOutcome {
    Attached(SharedContext),
    AlreadyAttached(SharedContext),
}

impl AttachOutcome {
    pub fn context(&self) -> &SharedContext {
        match self {
            AttachOutcome::Attached(c) | AttachOutcome::AlreadyAttached(c) => c,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, AttachOutcome::Attached(_))
    }
}

pub struct ContextTable {
    contexts: DashMap<ContextKey, SharedContext>,
    finalizer: Arc<dyn Finalizer>,
}

impl ContextTable {
    pub fn new(finalizer: Arc<dyn Finalizer>) -> Self {
        Self {
            contexts: DashMap::new(),
            finalizer,
        }
    }

    pub fn attach(&self, key: ContextKey, ctx: HandleContext) -> AttachOutcome {
        match self.contexts.entry(key) {
            Entry::Occupied(existing) => {
                debug!(?key, "context already attached, keeping existing");
                AttachOutcome::AlreadyAttached(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                debug!(?key, pid = ctx.requestor_pid, path = %ctx.path, "context attached");
                let shared = Arc::new(Mutex::new(ctx));
                slot.insert(shared.clone());
                AttachOutcome::Attached(shared)
            }
        }
    }

    pub fn get(&self, key: ContextKey) -> Option<SharedContext> {
        self.contexts.get(&key).map(|c| c.value().clone())
    }

    pub fn contains(&self, key: ContextKey) -> bool {
        self.contexts.contains_key(&key)
    }

    /// Applies `f` to an attached context. Returns `None` when nothing is
    /// attached or the context is already being finalized.
    pub fn update<R>(&self, key: ContextKey, f: impl FnOnce(&mut HandleContext) -> R) -> Option<R> {
        let shared = self.get(key)?;
        let mut ctx = shared.lock().unwrap_or_else(|e| e.into_inner());
        if ctx.state == ContextState::Finalizing {
            return None;
        }
        Some(f(&mut *ctx))
    }

    /// Copy of the context state.
    pub fn snapshot(&self, key: ContextKey) -> Option<HandleContext> {
        let shared = self.get(key)?;
        let ctx = shared.lock().unwrap_or_else(|e| e.into_inner());
        Some(ctx.clone())
    }

    /// Host released the handle or file object. Returns true if a context was finalized.
    pub fn release(&self, key: ContextKey) -> bool {
        let Some((_, shared)) = self.contexts.remove(&key) else {
            return false;
        };

        let ctx = {
            let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
            if guard.state == ContextState::Finalizing {
                warn!(?key, "context finalized twice");
                return false;
            }
            guard.state = ContextState::Finalizing;
            guard.clone()
        };

        self.finalizer.finalize(key, ctx);
        true
    }

    /// Explicit removal by a handler; finalizes like a release.
    pub fn delete(&self, key: ContextKey) -> bool {
        self.release(key)
    }

    /// Finalizes every attached context. Used on teardown.
    pub fn drain(&self) -> usize {
        let keys: Vec<ContextKey> = self.contexts.iter().map(|e| *e.key()).collect();
        keys.into_iter().filter(|&k| self.release(k)).count()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
