//! Set-information handling: rename, delete disposition, size changes.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::ContextKey;
use crate::registry::{OperationHandler, PostStatus, PreResult, SubContext};
use crate::request::{IoRequest, PostFlags, SetInfoClass};

use super::PolicyEnv;

/// Change to commit once the operation succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
enum InfoChange {
    Rename(String),
    Delete(bool),
    Allocation,
    EndOfFile,
    ValidDataLength,
}

pub struct SetInfoHandler {
    env: Arc<PolicyEnv>,
}

impl SetInfoHandler {
    pub fn new(env: Arc<PolicyEnv>) -> Self {
        Self { env }
    }
}

impl OperationHandler for SetInfoHandler {
    fn name(&self) -> &'static str {
        "set_information"
    }

    fn on_before(&self, req: &IoRequest) -> PreResult {
        let (Some(class), Some(handle)) = (req.set_info_class(), req.handle) else {
            return PreResult::no_callback();
        };
        let key = ContextKey::Handle(handle);

        if self.env.filter.ignores_requestor(req) || !self.env.contexts.contains(key) {
            return PreResult::no_callback();
        }

        let change = match class {
            SetInfoClass::Rename { .. } => match self.env.host.rename_target(req) {
                Ok(target) => InfoChange::Rename(target),
                Err(e) => {
                    warn!(path = %req.path, error = %e, "could not resolve rename target");
                    return PreResult::no_callback();
                }
            },
            SetInfoClass::Disposition { delete } => {
                if *delete {
                    self.env.protect(key);
                }
                InfoChange::Delete(*delete)
            }
            SetInfoClass::Allocation { .. } => InfoChange::Allocation,
            SetInfoClass::EndOfFile { .. } => InfoChange::EndOfFile,
            SetInfoClass::ValidDataLength { .. } => InfoChange::ValidDataLength,
            SetInfoClass::Basic => return PreResult::no_callback(),
        };

        PreResult::with_context(change)
    }

    fn on_after(
        &self,
        req: &IoRequest,
        sub_context: Option<SubContext>,
        _flags: PostFlags,
    ) -> PostStatus {
        let (Some(handle), Some(change)) = (
            req.handle,
            sub_context.and_then(|s| s.downcast::<InfoChange>().ok()),
        ) else {
            return PostStatus::Finished;
        };

        let change = *change;
        debug!(handle, path = %req.path, change = ?change, "set-information committed");
        self.env
            .contexts
            .update(ContextKey::Handle(handle), move |ctx| match change {
                InfoChange::Rename(target) => ctx.record_rename(target),
                InfoChange::Delete(delete) => ctx.deleted = delete,
                InfoChange::Allocation => ctx.alloc = true,
                InfoChange::EndOfFile => ctx.eof = true,
                InfoChange::ValidDataLength => ctx.valid_data_len = true,
            });

        PostStatus::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HandleContext;
    use crate::policy::testing::Fixture;
    use crate::registry::PreDisposition;
    use crate::request::IoStatus;

    fn set_info(fx: &Fixture, handle: u64, path: &str, class: SetInfoClass) -> PreDisposition {
        let handler = SetInfoHandler::new(fx.env.clone());
        let mut req = IoRequest::set_information(77, path, class).on_handle(handle, handle);
        let pre = handler.on_before(&req);
        req.status = IoStatus::Success { information: 0 };
        if pre.disposition == PreDisposition::WithCallback {
            handler.on_after(&req, pre.sub_context, PostFlags::default());
        }
        pre.disposition
    }

    fn tracked(fx: &Fixture, path: &str, size: u64) {
        let mut ctx = HandleContext::for_handle(77, path);
        ctx.preexisting = true;
        ctx.size_at_open = size;
        fx.attach(1, ctx);
    }

    #[test]
    fn test_rename_uses_host_resolved_target() {
        let fx = Fixture::new();
        tracked(&fx, "/data/a.txt", 0);

        set_info(
            &fx,
            1,
            "/data/a.txt",
            SetInfoClass::Rename {
                target: "a.txt.locked".to_string(),
                replace_if_exists: false,
            },
        );

        let ctx = fx.context(1);
        assert!(ctx.renamed);
        assert_eq!(ctx.new_path.as_deref(), Some("/resolved/a.txt.locked"));
        assert!(ctx.backup_id.is_none(), "rename alone takes no snapshot");
    }

    #[test]
    fn test_delete_disposition_snapshots_first() {
        let fx = Fixture::new();
        let path = fx.existing_file("a.txt", b"keep me");
        tracked(&fx, &path, 7);

        set_info(&fx, 1, &path, SetInfoClass::Disposition { delete: true });

        let ctx = fx.context(1);
        assert!(ctx.deleted);
        assert_eq!(fx.env.backups.read(ctx.backup_id.unwrap()).unwrap(), b"keep me");
    }

    #[test]
    fn test_undelete_clears_flag() {
        let fx = Fixture::new();
        let path = fx.existing_file("a.txt", b"keep me");
        tracked(&fx, &path, 7);

        set_info(&fx, 1, &path, SetInfoClass::Disposition { delete: true });
        set_info(&fx, 1, &path, SetInfoClass::Disposition { delete: false });
        assert!(!fx.context(1).deleted);
    }

    #[test]
    fn test_size_classes_set_visibility_flags_only() {
        let fx = Fixture::new();
        let path = fx.existing_file("a.txt", b"data");
        tracked(&fx, &path, 4);

        set_info(&fx, 1, &path, SetInfoClass::Allocation { size: 4096 });
        set_info(&fx, 1, &path, SetInfoClass::EndOfFile { size: 0 });
        set_info(&fx, 1, &path, SetInfoClass::ValidDataLength { length: 0 });

        let ctx = fx.context(1);
        assert!(ctx.alloc && ctx.eof && ctx.valid_data_len);
        assert!(ctx.backup_id.is_none());
        assert_eq!(ctx.action_count(), 3);
    }

    #[test]
    fn test_basic_info_ignored() {
        let fx = Fixture::new();
        tracked(&fx, "/data/a.txt", 0);
        assert_eq!(
            set_info(&fx, 1, "/data/a.txt", SetInfoClass::Basic),
            PreDisposition::NoCallback
        );
    }

    #[test]
    fn test_untracked_handle_ignored() {
        let fx = Fixture::new();
        assert_eq!(
            set_info(&fx, 9, "/data/a.txt", SetInfoClass::EndOfFile { size: 0 }),
            PreDisposition::NoCallback
        );
    }
}
