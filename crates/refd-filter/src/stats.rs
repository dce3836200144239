use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Pipeline-wide counters, updated lock-free from the I/O path.
#[derive(Debug, Default)]
pub struct PipelineStats {
    requests: AtomicU64,
    completed_in_pre: AtomicU64,
    contexts_attached: AtomicU64,
    contexts_finalized: AtomicU64,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
    events_suppressed: AtomicU64,
    backups_taken: AtomicU64,
    backups_present: AtomicU64,
    backup_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub completed_in_pre: u64,
    pub contexts_attached: u64,
    pub contexts_finalized: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
    pub events_suppressed: u64,
    pub backups_taken: u64,
    pub backups_present: u64,
    pub backup_failures: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completed_in_pre(&self) {
        self.completed_in_pre.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_contexts_attached(&self) {
        self.contexts_attached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_contexts_finalized(&self) {
        self.contexts_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_suppressed(&self) {
        self.events_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_backups_taken(&self) {
        self.backups_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_backups_present(&self) {
        self.backups_present.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_backup_failures(&self) {
        self.backup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            completed_in_pre: self.completed_in_pre.load(Ordering::Relaxed),
            contexts_attached: self.contexts_attached.load(Ordering::Relaxed),
            contexts_finalized: self.contexts_finalized.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_suppressed: self.events_suppressed.load(Ordering::Relaxed),
            backups_taken: self.backups_taken.load(Ordering::Relaxed),
            backups_present: self.backups_present.load(Ordering::Relaxed),
            backup_failures: self.backup_failures.load(Ordering::Relaxed),
        }
    }
}
