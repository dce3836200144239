//! Protection policy handlers.
//!
//! One handler per operation type decides when to snapshot a file and which
//! facts to record on the handle context. Internal failures (backup errors,
//! host query errors) are logged and never fail the user's I/O.

pub mod create;
pub mod filter;
pub mod fs_control;
pub mod read;
pub mod section;
pub mod set_info;
pub mod write;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backup::{BackupId, BackupOutcome, BackupStore};
use crate::config::PolicyConfig;
use crate::context::ContextKey;
use crate::context_table::ContextTable;
use crate::host::HostFs;
use crate::registry::{FeatureModule, RegistryBuilder};
use crate::request::OpCode;
use crate::stats::PipelineStats;

pub use filter::PathFilter;

/// Shared state the policy handlers operate on.
pub struct PolicyEnv {
    pub config: PolicyConfig,
    pub filter: PathFilter,
    pub host: Arc<dyn HostFs>,
    pub contexts: Arc<ContextTable>,
    pub backups: Arc<BackupStore>,
    pub stats: Arc<PipelineStats>,
}

impl PolicyEnv {
    pub fn new(
        config: PolicyConfig,
        host: Arc<dyn HostFs>,
        contexts: Arc<ContextTable>,
        backups: Arc<BackupStore>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let filter = PathFilter::new(&config, &[backups.root(), backups.staging_dir()]);
        Self {
            config,
            filter,
            host,
            contexts,
            backups,
            stats,
        }
    }

    /// Snapshots `path`, returning the backup id on success.
    pub fn snapshot(&self, path: &str) -> Option<BackupId> {
        match self.backups.backup(path) {
            Ok(snap) => {
                match snap.outcome {
                    BackupOutcome::Created => self.stats.increment_backups_taken(),
                    BackupOutcome::AlreadyPresent => self.stats.increment_backups_present(),
                }
                Some(snap.id)
            }
            Err(e) => {
                warn!(path, error = %e, "backup failed, continuing without snapshot");
                self.stats.increment_backup_failures();
                None
            }
        }
    }

    /// Snapshots the file behind `key` if its context still needs one.
    pub fn protect(&self, key: ContextKey) {
        let pending = self.contexts.update(key, |ctx| {
            ctx.needs_backup().then(|| ctx.current_path().to_string())
        });
        let Some(Some(path)) = pending else {
            return;
        };

        if let Some(id) = self.snapshot(&path) {
            self.contexts.update(key, |ctx| {
                ctx.backup_id.get_or_insert(id);
            });
            debug!(?key, path, backup_id = %id, "snapshot recorded on context");
        }
    }
}

/// Registers the protection handlers.
pub struct ProtectionModule {
    env: Arc<PolicyEnv>,
}

impl ProtectionModule {
    pub fn new(env: Arc<PolicyEnv>) -> Self {
        Self { env }
    }
}

impl FeatureModule for ProtectionModule {
    fn register(&self, registry: &mut RegistryBuilder) {
        registry.register(
            OpCode::Create,
            Arc::new(create::CreateHandler::new(self.env.clone())),
        );
        registry.register(
            OpCode::Write,
            Arc::new(write::WriteHandler::new(self.env.clone())),
        );
        if self.env.config.track_reads {
            registry.register(
                OpCode::Read,
                Arc::new(read::ReadHandler::new(self.env.clone())),
            );
        }
        registry.register(
            OpCode::SetInformation,
            Arc::new(set_info::SetInfoHandler::new(self.env.clone())),
        );
        registry.register(
            OpCode::AcquireForSectionSync,
            Arc::new(section::SectionHandler::new(self.env.clone())),
        );
        registry.register(
            OpCode::FileSystemControl,
            Arc::new(fs_control::FsControlHandler::new(self.env.clone())),
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::BackupConfig;
    use crate::context::HandleContext;
    use crate::context_table::Finalizer;
    use crate::error::Result;
    use crate::request::{IoRequest, SetInfoClass};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    pub struct FakeHost {
        pub sizes: Mutex<HashMap<String, u64>>,
        pub images: Mutex<HashMap<u32, String>>,
        pub no_handle_state: bool,
    }

    impl HostFs for FakeHost {
        fn supports_handle_state(&self, _req: &IoRequest) -> bool {
            !self.no_handle_state
        }

        fn rename_target(&self, req: &IoRequest) -> Result<String> {
            match req.set_info_class() {
                Some(SetInfoClass::Rename { target, .. }) => Ok(format!("/resolved/{}", target)),
                _ => Err(crate::error::FilterError::InvalidRequest {
                    reason: "not a rename".to_string(),
                }),
            }
        }

        fn file_size(&self, path: &str) -> Result<Option<u64>> {
            Ok(self.sizes.lock().unwrap().get(path).copied())
        }

        fn process_image(&self, pid: u32) -> Option<String> {
            self.images.lock().unwrap().get(&pid).cloned()
        }
    }

    #[derive(Default)]
    pub struct Collected(pub Mutex<Vec<HandleContext>>);

    impl Finalizer for Collected {
        fn finalize(&self, _key: ContextKey, ctx: HandleContext) {
            self.0.lock().unwrap().push(ctx);
        }
    }

    pub struct Fixture {
        pub dir: TempDir,
        pub host: Arc<FakeHost>,
        pub finalized: Arc<Collected>,
        pub env: Arc<PolicyEnv>,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_host(FakeHost::default())
        }

        pub fn with_host(host: FakeHost) -> Self {
            let dir = TempDir::new().unwrap();
            let host = Arc::new(host);
            let finalized = Arc::new(Collected::default());
            let backups = Arc::new(BackupStore::new(&BackupConfig::new(
                dir.path().join("backups"),
            )));
            backups.prepare().unwrap();
            let env = Arc::new(PolicyEnv::new(
                PolicyConfig::default(),
                host.clone(),
                Arc::new(ContextTable::new(finalized.clone())),
                backups,
                Arc::new(PipelineStats::new()),
            ));
            Self {
                dir,
                host,
                finalized,
                env,
            }
        }

        /// Writes a real file and registers its size with the fake host.
        pub fn existing_file(&self, name: &str, data: &[u8]) -> String {
            let path = self.dir.path().join(name);
            std::fs::write(&path, data).unwrap();
            let path = path.to_string_lossy().into_owned();
            self.host
                .sizes
                .lock()
                .unwrap()
                .insert(path.clone(), data.len() as u64);
            path
        }

        pub fn attach(&self, handle: u64, ctx: HandleContext) {
            self.env.contexts.attach(ContextKey::Handle(handle), ctx);
        }

        pub fn context(&self, handle: u64) -> HandleContext {
            self.env
                .contexts
                .snapshot(ContextKey::Handle(handle))
                .expect("context attached")
        }
    }
}
