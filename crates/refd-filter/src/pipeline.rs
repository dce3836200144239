//! Pipeline assembly and lifecycle.
//!
//! A [`Pipeline`] owns the registry, the context table, the backup store and
//! the event channel. The host drives it through pre/post dispatch and the
//! release callbacks; contexts leaving the table are turned into event records
//! by [`ChannelFinalizer`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::backup::BackupStore;
use crate::channel::{ConsumerPort, EventChannel};
use crate::config::FilterConfig;
use crate::context::{ContextKey, HandleContext};
use crate::context_table::{ContextTable, Finalizer};
use crate::dispatch::{CompletionContext, Dispatcher, PreOutcome};
use crate::error::{FilterError, Result};
use crate::host::HostFs;
use crate::policy::{PolicyEnv, ProtectionModule};
use crate::record::EventRecord;
use crate::registry::{FeatureModule, OperationRegistry, PostStatus, RegistryBuilder};
use crate::request::{FileId, HandleId, IoRequest, PostFlags};
use crate::stats::{PipelineStats, StatsSnapshot};

/// Sends one event per finalized context that recorded at least one action.
pub struct ChannelFinalizer {
    channel: Arc<EventChannel>,
    stats: Arc<PipelineStats>,
}

impl ChannelFinalizer {
    pub fn new(channel: Arc<EventChannel>, stats: Arc<PipelineStats>) -> Self {
        Self { channel, stats }
    }
}

impl Finalizer for ChannelFinalizer {
    fn finalize(&self, key: ContextKey, ctx: HandleContext) {
        self.stats.increment_contexts_finalized();

        if ctx.action_count() == 0 {
            trace!(?key, path = %ctx.path, "no actions recorded, event suppressed");
            self.stats.increment_events_suppressed();
            return;
        }

        let record = EventRecord::from_context(&ctx);
        if !record.is_delivered_as(self.channel.format()) {
            trace!(?key, path = %ctx.path, "file deleted, path-only event suppressed");
            self.stats.increment_events_suppressed();
            return;
        }

        match self.channel.send(&record) {
            Ok(()) => {
                debug!(
                    ?key,
                    path = %record.path,
                    process = ctx.process_path.as_deref().unwrap_or("?"),
                    actions = ctx.action_count(),
                    "event sent"
                );
                self.stats.increment_events_sent();
            }
            Err(e) => {
                warn!(?key, path = %record.path, error = %e, "event dropped");
                self.stats.increment_events_dropped();
            }
        }
    }
}

pub struct PipelineBuilder {
    config: FilterConfig,
    host: Arc<dyn HostFs>,
    modules: Vec<Box<dyn FeatureModule>>,
    protection: bool,
}

impl PipelineBuilder {
    /// Adds a feature module. Its handlers run after the protection handlers.
    pub fn module(mut self, module: Box<dyn FeatureModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Builds the pipeline without the built-in protection handlers.
    pub fn without_protection(mut self) -> Self {
        self.protection = false;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let stats = Arc::new(PipelineStats::new());
        let channel = Arc::new(EventChannel::new(&self.config.channel));
        let finalizer = Arc::new(ChannelFinalizer::new(channel.clone(), stats.clone()));
        let contexts = Arc::new(ContextTable::new(finalizer));
        let backups = Arc::new(BackupStore::new(&self.config.backup));

        let env = Arc::new(PolicyEnv::new(
            self.config.policy.clone(),
            self.host,
            contexts.clone(),
            backups.clone(),
            stats.clone(),
        ));

        let mut registry = RegistryBuilder::new();
        if self.protection {
            registry.add_module(&ProtectionModule::new(env));
        }
        for module in &self.modules {
            registry.add_module(module.as_ref());
        }
        let registry = Arc::new(registry.build());
        debug!(handlers = registry.len(), ops = ?registry.ops(), "registry built");

        Ok(Pipeline {
            dispatcher: Dispatcher::new(registry, stats.clone()),
            config: self.config,
            channel,
            contexts,
            backups,
            stats,
            running: AtomicBool::new(false),
        })
    }
}

pub struct Pipeline {
    config: FilterConfig,
    dispatcher: Dispatcher,
    channel: Arc<EventChannel>,
    contexts: Arc<ContextTable>,
    backups: Arc<BackupStore>,
    stats: Arc<PipelineStats>,
    running: AtomicBool,
}

impl Pipeline {
    pub fn builder(config: FilterConfig, host: Arc<dyn HostFs>) -> PipelineBuilder {
        PipelineBuilder {
            config,
            host,
            modules: Vec::new(),
            protection: true,
        }
    }

    /// Prepares the backup store and begins accepting requests.
    pub fn start(&self) -> Result<()> {
        self.backups.prepare()?;
        self.running.store(true, Ordering::SeqCst);
        info!(
            backup_root = %self.backups.root().display(),
            channel = %self.channel.name(),
            handlers = self.dispatcher.registry().len(),
            "pipeline started"
        );
        Ok(())
    }

    /// Stops accepting requests, finalizes every attached context and then
    /// disconnects the consumer.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let finalized = self.contexts.drain();
        self.channel.disconnect();
        info!(finalized, "pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pre_operation(&self, req: &IoRequest) -> PreOutcome {
        self.pre_operation_with(req, None)
    }

    pub fn pre_operation_with(
        &self,
        req: &IoRequest,
        existing: Option<CompletionContext>,
    ) -> PreOutcome {
        if !self.is_running() {
            return PreOutcome::NoCallback;
        }
        self.dispatcher.pre_operation_with(req, existing)
    }

    /// Post dispatch. Requests still in flight when the pipeline stops are
    /// completed as draining.
    pub fn post_operation(&self, req: &IoRequest, ctx: Option<CompletionContext>) -> PostStatus {
        let flags = PostFlags {
            draining: !self.is_running(),
        };
        self.dispatcher.post_operation(req, ctx, flags)
    }

    /// The host closed a stream handle.
    pub fn release_handle(&self, handle: HandleId) -> bool {
        self.contexts.release(ContextKey::Handle(handle))
    }

    /// The host tore down the file object behind one or more handles.
    pub fn release_file(&self, file: FileId) -> bool {
        self.contexts.release(ContextKey::File(file))
    }

    /// Connects the consumer. Fails with `NotRunning` before `start` or after `stop`.
    pub fn connect(&self) -> Result<ConsumerPort> {
        if !self.is_running() {
            return Err(FilterError::NotRunning);
        }
        self.channel.connect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        self.dispatcher.registry()
    }

    pub fn contexts(&self) -> &ContextTable {
        &self.contexts
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
