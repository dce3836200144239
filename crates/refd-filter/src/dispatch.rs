//! Pre/post dispatch core.
//!
//! [`Dispatcher::pre_operation`] walks the registry for the request's
//! operation code and records each handler's disposition and sub-context in a
//! [`CompletionContext`]. The context is handed back to the host inside
//! [`PreOutcome::WithCallback`] and returned to [`Dispatcher::post_operation`]
//! exactly once, which runs the eligible post-handlers and then drops it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::registry::{HandlerId, OperationRegistry, PreDisposition, PostStatus, SubContext};
use crate::request::{IoRequest, IoStatus, PostFlags};
use crate::stats::PipelineStats;

struct Slot {
    disposition: PreDisposition,
    sub_context: Option<SubContext>,
}

/// Per-request correlation state between pre- and post-dispatch.
pub struct CompletionContext {
    registry_len: usize,
    slots: HashMap<HandlerId, Slot>,
}

impl CompletionContext {
    fn new(registry_len: usize) -> Self {
        Self {
            registry_len,
            slots: HashMap::with_capacity(registry_len),
        }
    }

    /// Registry length at the time the request entered pre-dispatch.
    pub fn registry_len(&self) -> usize {
        self.registry_len
    }

    pub fn disposition(&self, id: HandlerId) -> Option<PreDisposition> {
        self.slots.get(&id).map(|s| s.disposition)
    }

    pub fn has_sub_context(&self, id: HandlerId) -> bool {
        self.slots
            .get(&id)
            .map(|s| s.sub_context.is_some())
            .unwrap_or(false)
    }

    /// Number of handlers whose post side will run.
    pub fn pending_posts(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.disposition == PreDisposition::WithCallback)
            .count()
    }
}

impl fmt::Debug for CompletionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionContext")
            .field("registry_len", &self.registry_len)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Result of pre-dispatch, returned to the host.
#[derive(Debug)]
pub enum PreOutcome {
    /// Nothing to track; the host must not call post-dispatch.
    NoCallback,
    /// A handler completed the request; the real operation does not run.
    Complete(IoStatus),
    /// Post-dispatch must be called with this context once the operation ran.
    WithCallback(CompletionContext),
}

impl PreOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, PreOutcome::Complete(_))
    }

    /// Splits the outcome into the completion status, if any, and the context to return.
    pub fn into_parts(self) -> (Option<IoStatus>, Option<CompletionContext>) {
        match self {
            PreOutcome::NoCallback => (None, None),
            PreOutcome::Complete(status) => (Some(status), None),
            PreOutcome::WithCallback(ctx) => (None, Some(ctx)),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<OperationRegistry>,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    pub fn new(registry: Arc<OperationRegistry>, stats: Arc<PipelineStats>) -> Self {
        Self { registry, stats }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn pre_operation(&self, req: &IoRequest) -> PreOutcome {
        self.pre_operation_with(req, None)
    }

    /// Pre-dispatch that reuses `existing` when the host re-enters the chain
    /// for a request it already started. Slots of handlers that run again are
    /// replaced.
    pub fn pre_operation_with(
        &self,
        req: &IoRequest,
        existing: Option<CompletionContext>,
    ) -> PreOutcome {
        if req.handle.is_none() {
            trace!(op = ?req.op, "request without file object, not tracked");
            return PreOutcome::NoCallback;
        }

        self.stats.increment_requests();
        let mut ctx = existing.unwrap_or_else(|| CompletionContext::new(self.registry.len()));

        for entry in self.registry.matching(req.op) {
            let result = entry.handler.on_before(req);

            if let PreDisposition::Complete(status) = result.disposition {
                debug!(
                    handler = entry.handler.name(),
                    op = ?req.op,
                    path = %req.path,
                    ?status,
                    "request completed in pre-operation"
                );
                self.stats.increment_completed_in_pre();
                return PreOutcome::Complete(status);
            }

            ctx.slots.insert(
                entry.id,
                Slot {
                    disposition: result.disposition,
                    sub_context: result.sub_context,
                },
            );
        }

        PreOutcome::WithCallback(ctx)
    }

    pub fn post_operation(
        &self,
        req: &IoRequest,
        ctx: Option<CompletionContext>,
        flags: PostFlags,
    ) -> PostStatus {
        let Some(mut ctx) = ctx else {
            return PostStatus::Finished;
        };

        if flags.draining || !req.status.is_success() {
            trace!(
                op = ?req.op,
                draining = flags.draining,
                status = ?req.status,
                "skipping post-operation handlers"
            );
            return PostStatus::Finished;
        }

        let mut status = PostStatus::Finished;
        for entry in self.registry.matching(req.op) {
            let Some(slot) = ctx.slots.remove(&entry.id) else {
                continue;
            };
            if slot.disposition != PreDisposition::WithCallback {
                continue;
            }
            if entry.handler.on_after(req, slot.sub_context, flags)
                == PostStatus::MoreProcessingRequired
            {
                status = PostStatus::MoreProcessingRequired;
            }
        }

        status
    }
}
