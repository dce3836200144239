use std::sync::Arc;

use crate::context::ContextKey;
use crate::registry::{OperationHandler, PostStatus, PreResult, SubContext};
use crate::request::{FsControlCode, IoRequest, OpParams, PostFlags};

use super::PolicyEnv;

/// Flags fs-control requests that rewrite file data outside the write path.
pub struct FsControlHandler {
    env: Arc<PolicyEnv>,
}

impl FsControlHandler {
    pub fn new(env: Arc<PolicyEnv>) -> Self {
        Self { env }
    }
}

impl OperationHandler for FsControlHandler {
    fn name(&self) -> &'static str {
        "fs_control"
    }

    fn on_before(&self, req: &IoRequest) -> PreResult {
        let (OpParams::FsControl(code), Some(handle)) = (&req.params, req.handle) else {
            return PreResult::no_callback();
        };

        if matches!(code, FsControlCode::Other(_))
            || self.env.filter.ignores_requestor(req)
            || !self.env.contexts.contains(ContextKey::Handle(handle))
        {
            return PreResult::no_callback();
        }

        PreResult::with_context(*code)
    }

    fn on_after(
        &self,
        req: &IoRequest,
        sub_context: Option<SubContext>,
        _flags: PostFlags,
    ) -> PostStatus {
        let (Some(handle), Some(code)) = (
            req.handle,
            sub_context.and_then(|s| s.downcast::<FsControlCode>().ok()),
        ) else {
            return PostStatus::Finished;
        };

        self.env
            .contexts
            .update(ContextKey::Handle(handle), |ctx| match *code {
                FsControlCode::OffloadWrite => ctx.fsctl_offload_write = true,
                FsControlCode::WriteRawEncrypted => ctx.fsctl_write_raw_encrypted = true,
                FsControlCode::SetZeroData => ctx.fsctl_set_zero_data = true,
                FsControlCode::Other(_) => {}
            });
        PostStatus::Finished
    }
}
