//! Create handling: snapshot before destructive opens, attach the handle context.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::backup::BackupId;
use crate::context::{ContextKey, HandleContext};
use crate::registry::{OperationHandler, PostStatus, PreResult, SubContext};
use crate::request::{CreateInfo, IoRequest, PostFlags};

use super::PolicyEnv;

/// What pre-create learned about the target before the open ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct OpenProbe {
    preexisting: bool,
    size: u64,
    backup_id: Option<BackupId>,
}

pub struct CreateHandler {
    env: Arc<PolicyEnv>,
}

impl CreateHandler {
    pub fn new(env: Arc<PolicyEnv>) -> Self {
        Self { env }
    }
}

impl OperationHandler for CreateHandler {
    fn name(&self) -> &'static str {
        "create"
    }

    fn on_before(&self, req: &IoRequest) -> PreResult {
        let Some(params) = req.create_params() else {
            return PreResult::no_callback();
        };

        if params.directory
            || params.open_target_directory
            || params.paging_file
            || params.volume_open
        {
            return PreResult::no_callback();
        }

        if self.env.filter.ignores_requestor(req) || !self.env.filter.accepts_path(&req.path) {
            trace!(path = %req.path, "create not tracked");
            return PreResult::no_callback();
        }

        let size = match self.env.host.file_size(&req.path) {
            Ok(size) => size,
            Err(e) => {
                debug!(path = %req.path, error = %e, "size query failed, treating as absent");
                None
            }
        };

        let mut probe = OpenProbe {
            preexisting: size.is_some(),
            size: size.unwrap_or(0),
            backup_id: None,
        };

        if (params.disposition.destroys_existing() || params.delete_on_close) && probe.size > 0 {
            probe.backup_id = self.env.snapshot(&req.path);
        }

        PreResult::with_context(probe)
    }

    fn on_after(
        &self,
        req: &IoRequest,
        sub_context: Option<SubContext>,
        _flags: PostFlags,
    ) -> PostStatus {
        let (Some(params), Some(handle)) = (req.create_params(), req.handle) else {
            return PostStatus::Finished;
        };

        let probe = sub_context
            .and_then(|s| s.downcast::<OpenProbe>().ok())
            .map(|p| *p)
            .unwrap_or_default();

        if !self.env.host.supports_handle_state(req) {
            debug!(path = %req.path, "host cannot attach state to this handle");
            return PostStatus::Finished;
        }

        if !(params.access.is_modifying() || params.delete_on_close || probe.preexisting) {
            return PostStatus::Finished;
        }

        let mut ctx = HandleContext::for_handle(req.requestor_pid, req.path.clone());
        ctx.process_path = self.env.host.process_image(req.requestor_pid);
        ctx.created = req.create_info() == Some(CreateInfo::Created);
        ctx.deleted = params.delete_on_close;
        ctx.preexisting = probe.preexisting && !ctx.created;
        ctx.size_at_open = probe.size;
        if !ctx.created {
            ctx.backup_id = probe.backup_id;
        }

        let outcome = self.env.contexts.attach(ContextKey::Handle(handle), ctx);
        if outcome.is_new() {
            self.env.stats.increment_contexts_attached();
        }

        PostStatus::Finished
    }
}
