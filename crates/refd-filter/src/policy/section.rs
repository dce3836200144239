use std::sync::Arc;

use crate::context::{ContextKey, HandleContext};
use crate::registry::{OperationHandler, PostStatus, PreResult, SubContext};
use crate::request::{IoRequest, OpParams, PostFlags, SyncType};

use super::PolicyEnv;

/// Attaches a file-level context when a writable section is created, so
/// later paging writes through the mapping can be attributed.
pub struct SectionHandler {
    env: Arc<PolicyEnv>,
}

impl SectionHandler {
    pub fn new(env: Arc<PolicyEnv>) -> Self {
        Self { env }
    }
}

impl OperationHandler for SectionHandler {
    fn name(&self) -> &'static str {
        "section_sync"
    }

    fn on_before(&self, req: &IoRequest) -> PreResult {
        let OpParams::SectionSync(params) = &req.params else {
            return PreResult::no_callback();
        };

        let writable =
            params.sync_type == SyncType::CreateSection && params.protection.is_writable();
        if !writable
            || req.file.is_none()
            || self.env.filter.ignores_requestor(req)
            || !self.env.filter.accepts_path(&req.path)
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
        let Some(file) = req.file else {
            return PostStatus::Finished;
        };
        if !self.env.host.supports_handle_state(req) {
            return PostStatus::Finished;
        }

        let ctx = HandleContext::for_mapping(req.requestor_pid, req.path.clone());
        if self.env.contexts.attach(ContextKey::File(file), ctx).is_new() {
            self.env.stats.increment_contexts_attached();
        }
        PostStatus::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::testing::Fixture;
    use crate::registry::PreDisposition;
    use crate::request::{IoStatus, PageProtection, SectionSyncParams};

    fn section(fx: &Fixture, file: u64, params: SectionSyncParams) -> PreDisposition {
        let handler = SectionHandler::new(fx.env.clone());
        let mut req = IoRequest::section_sync(12, "/data/mapped.bin", params).on_handle(1, file);
        let pre = handler.on_before(&req);
        req.status = IoStatus::Success { information: 0 };
        if pre.disposition == PreDisposition::WithCallback {
            handler.on_after(&req, pre.sub_context, PostFlags::default());
        }
        pre.disposition
    }

    #[test]
    fn test_writable_section_attaches_file_context() {
        let fx = Fixture::new();
        section(
            &fx,
            3,
            SectionSyncParams {
                sync_type: SyncType::CreateSection,
                protection: PageProtection::ReadWrite,
            },
        );

        let ctx = fx.env.contexts.snapshot(ContextKey::File(3)).unwrap();
        assert!(ctx.mmap_open);
        assert!(!ctx.mmap_modified);
        assert_eq!(ctx.requestor_pid, 12);
    }

    #[test]
    fn test_read_only_section_ignored() {
        let fx = Fixture::new();
        let disposition = section(
            &fx,
            3,
            SectionSyncParams {
                sync_type: SyncType::CreateSection,
                protection: PageProtection::ReadOnly,
            },
        );
        assert_eq!(disposition, PreDisposition::NoCallback);
        assert!(fx.env.contexts.is_empty());
    }

    #[test]
    fn test_other_sync_type_ignored() {
        let fx = Fixture::new();
        let disposition = section(
            &fx,
            3,
            SectionSyncParams {
                sync_type: SyncType::Other,
                protection: PageProtection::ExecuteReadWrite,
            },
        );
        assert_eq!(disposition, PreDisposition::NoCallback);
    }

    #[test]
    fn test_existing_mapping_context_kept() {
        let fx = Fixture::new();
        let params = SectionSyncParams {
            sync_type: SyncType::CreateSection,
            protection: PageProtection::ReadWrite,
        };
        section(&fx, 3, params);
        section(&fx, 3, params);
        assert_eq!(fx.env.contexts.len(), 1);
        assert_eq!(fx.env.stats.snapshot().contexts_attached, 1);
    }
}
