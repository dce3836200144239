//! Write handling.
//!
//! Cached writes snapshot the file before the first overwrite and then record
//! the write on the handle context. Paging writes only mark the mapped file
//! modified; the snapshot decision is not re-run since the mapped data may
//! already differ from what is on disk.

use std::sync::Arc;

use tracing::trace;

use crate::context::ContextKey;
use crate::registry::{OperationHandler, PostStatus, PreResult, SubContext};
use crate::request::{IoRequest, PostFlags};

use super::PolicyEnv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePath {
    Cached,
    Paging,
}

pub struct WriteHandler {
    env: Arc<PolicyEnv>,
}

impl WriteHandler {
    pub fn new(env: Arc<PolicyEnv>) -> Self {
        Self { env }
    }

    fn finish_paging(&self, req: &IoRequest) {
        let contexts = &self.env.contexts;

        if let Some(file) = req.file {
            let key = ContextKey::File(file);
            if contexts.update(key, |ctx| ctx.mmap_modified = true).is_some() {
                contexts.delete(key);
                return;
            }
        }

        if let Some(handle) = req.handle {
            contexts.update(ContextKey::Handle(handle), |ctx| ctx.modified = true);
        }
    }
}

impl OperationHandler for WriteHandler {
    fn name(&self) -> &'static str {
        "write"
    }

    fn on_before(&self, req: &IoRequest) -> PreResult {
        let (Some(params), Some(handle)) = (req.write_params(), req.handle) else {
            return PreResult::no_callback();
        };
        let contexts = &self.env.contexts;

        if params.paging_io {
            let tracked = req.file.is_some_and(|f| contexts.contains(ContextKey::File(f)))
                || contexts.contains(ContextKey::Handle(handle));
            return if tracked {
                PreResult::with_context(WritePath::Paging)
            } else {
                PreResult::no_callback()
            };
        }

        if self.env.filter.ignores_requestor(req) {
            return PreResult::no_callback();
        }

        let key = ContextKey::Handle(handle);
        if !contexts.contains(key) {
            trace!(handle, path = %req.path, "write on untracked handle");
            return PreResult::no_callback();
        }

        self.env.protect(key);
        PreResult::with_context(WritePath::Cached)
    }

    fn on_after(
        &self,
        req: &IoRequest,
        sub_context: Option<SubContext>,
        _flags: PostFlags,
    ) -> PostStatus {
        let path = sub_context
            .and_then(|s| s.downcast::<WritePath>().ok())
            .map(|p| *p);

        match path {
            Some(WritePath::Paging) => self.finish_paging(req),
            Some(WritePath::Cached) => {
                let (Some(params), Some(handle)) = (req.write_params(), req.handle) else {
                    return PostStatus::Finished;
                };
                let written = (req.status.information() as usize).min(params.data.len());
                self.env
                    .contexts
                    .update(ContextKey::Handle(handle), |ctx| {
                        ctx.record_write(&params.data[..written])
                    });
            }
            None => {}
        }

        PostStatus::Finished
    }
}
