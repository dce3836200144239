use std::sync::Arc;

use crate::context::ContextKey;
use crate::registry::{OperationHandler, PostStatus, PreResult, SubContext};
use crate::request::{IoRequest, PostFlags};

use super::PolicyEnv;

/// Records read volume and entropy on tracked handles.
pub struct ReadHandler {
    env: Arc<PolicyEnv>,
}

impl ReadHandler {
    pub fn new(env: Arc<PolicyEnv>) -> Self {
        Self { env }
    }
}

impl OperationHandler for ReadHandler {
    fn name(&self) -> &'static str {
        "read"
    }

    fn on_before(&self, req: &IoRequest) -> PreResult {
        let (Some(params), Some(handle)) = (req.read_params(), req.handle) else {
            return PreResult::no_callback();
        };

        if params.paging_io
            || self.env.filter.ignores_requestor(req)
            || !self.env.contexts.contains(ContextKey::Handle(handle))
        {
            return PreResult::no_callback();
        }

        PreResult::with_callback()
    }

    fn on_after(
        &self,
        req: &IoRequest,
        _sub_context: Option<SubContext>,
        _flags: PostFlags,
    ) -> PostStatus {
        let (Some(params), Some(handle)) = (req.read_params(), req.handle) else {
            return PostStatus::Finished;
        };

        let read = (req.status.information() as usize).min(params.buffer.len());
        self.env
            .contexts
            .update(ContextKey::Handle(handle), |ctx| {
                ctx.record_read(&params.buffer[..read])
            });
        PostStatus::Finished
    }
}
