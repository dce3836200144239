//! Per-handle activity record.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::backup::BackupId;
use crate::entropy;
use crate::request::{FileId, HandleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextKind {
    /// Bound to one open handle.
    StreamHandle,
    /// Bound to the underlying file across handles (mapped sections).
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextKey {
    Handle(HandleId),
    File(FileId),
}

impl ContextKey {
    pub fn kind(&self) -> ContextKind {
        match self {
            ContextKey::Handle(_) => ContextKind::StreamHandle,
            ContextKey::File(_) => ContextKind::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContextState {
    #[default]
    Attached,
    Finalizing,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Byte, operation and entropy counters for one direction of I/O.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IoCounters {
    pub bytes: u64,
    pub ops: u64,
    pub entropy: f64,
    pub first_at_ms: Option<u64>,
    pub last_at_ms: Option<u64>,
}

impl IoCounters {
    pub fn record(&mut self, data: &[u8]) {
        let at = now_millis();
        self.entropy = entropy::running_mean(self.entropy, self.ops, entropy::shannon(data));
        self.bytes += data.len() as u64;
        self.ops += 1;
        self.first_at_ms.get_or_insert(at);
        self.last_at_ms = Some(at);
    }
}

/// Facts accumulated while a handle is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleContext {
    pub kind: ContextKind,
    pub state: ContextState,
    pub requestor_pid: u32,
    /// Executable of the requesting process, captured at attach.
    pub process_path: Option<String>,
    pub path: String,
    pub new_path: Option<String>,
    pub backup_id: Option<BackupId>,
    pub preexisting: bool,
    pub size_at_open: u64,

    pub created: bool,
    pub modified: bool,
    pub deleted: bool,
    pub renamed: bool,

    pub read: bool,
    pub alloc: bool,
    pub eof: bool,
    pub valid_data_len: bool,
    pub fsctl_offload_write: bool,
    pub fsctl_write_raw_encrypted: bool,
    pub fsctl_set_zero_data: bool,
    pub mmap_open: bool,
    pub mmap_modified: bool,

    pub reads: IoCounters,
    pub writes: IoCounters,
}

impl HandleContext {
    pub fn new(kind: ContextKind, requestor_pid: u32, path: impl Into<String>) -> Self {
        Self {
            kind,
            state: ContextState::Attached,
            requestor_pid,
            process_path: None,
            path: path.into(),
            new_path: None,
            backup_id: None,
            preexisting: false,
            size_at_open: 0,
            created: false,
            modified: false,
            deleted: false,
            renamed: false,
            read: false,
            alloc: false,
            eof: false,
            valid_data_len: false,
            fsctl_offload_write: false,
            fsctl_write_raw_encrypted: false,
            fsctl_set_zero_data: false,
            mmap_open: false,
            mmap_modified: false,
            reads: IoCounters::default(),
            writes: IoCounters::default(),
        }
    }

    pub fn for_handle(requestor_pid: u32, path: impl Into<String>) -> Self {
        Self::new(ContextKind::StreamHandle, requestor_pid, path)
    }

    pub fn for_mapping(requestor_pid: u32, path: impl Into<String>) -> Self {
        let mut ctx = Self::new(ContextKind::File, requestor_pid, path);
        ctx.mmap_open = true;
        ctx
    }

    /// Where the file lives now, following a rename on this handle.
    pub fn current_path(&self) -> &str {
        self.new_path.as_deref().unwrap_or(&self.path)
    }

    /// Number of set flags that describe a change to the file.
    ///
    /// `read` and `mmap_open` are not counted.
    pub fn action_count(&self) -> u32 {
        [
            self.created,
            self.modified,
            self.deleted,
            self.renamed,
            self.alloc,
            self.eof,
            self.valid_data_len,
            self.fsctl_offload_write,
            self.fsctl_write_raw_encrypted,
            self.fsctl_set_zero_data,
            self.mmap_modified,
        ]
        .iter()
        .filter(|&&f| f)
        .count() as u32
    }

    /// Whether a write or delete on this handle should snapshot the file first.
    /// Never true for a file created by this handle.
    pub fn needs_backup(&self) -> bool {
        !self.created
            && !self.deleted
            && self.backup_id.is_none()
            && self.preexisting
            && self.size_at_open > 0
    }

    pub fn record_write(&mut self, data: &[u8]) {
        self.modified = true;
        self.writes.record(data);
    }

    pub fn record_read(&mut self, data: &[u8]) {
        self.read = true;
        self.reads.record(data);
    }

    pub fn record_rename(&mut self, new_path: String) {
        self.renamed = true;
        self.new_path = Some(new_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_has_no_actions() {
        let ctx = HandleContext::for_handle(4, "/data/a.txt");
        assert_eq!(ctx.action_count(), 0);
        assert_eq!(ctx.kind, ContextKind::StreamHandle);
        assert_eq!(ctx.state, ContextState::Attached);
    }

    #[test]
    fn test_reads_do_not_count() {
        let mut ctx = HandleContext::for_handle(4, "/data/a.txt");
        ctx.record_read(b"hello");
        assert!(ctx.read);
        assert_eq!(ctx.action_count(), 0);
        assert_eq!(ctx.reads.bytes, 5);
        assert_eq!(ctx.reads.ops, 1);
    }

    #[test]
    fn test_mapping_open_does_not_count() {
        let mut ctx = HandleContext::for_mapping(4, "/data/a.txt");
        assert!(ctx.mmap_open);
        assert_eq!(ctx.kind, ContextKind::File);
        assert_eq!(ctx.action_count(), 0);
        ctx.mmap_modified = true;
        assert_eq!(ctx.action_count(), 1);
    }

    #[test]
    fn test_action_count_sums_flags() {
        let mut ctx = HandleContext::for_handle(4, "/data/a.txt");
        ctx.record_write(b"x");
        ctx.record_rename("/data/a.txt.locked".to_string());
        ctx.eof = true;
        assert_eq!(ctx.action_count(), 3);
    }

    #[test]
    fn test_current_path_follows_rename() {
        let mut ctx = HandleContext::for_handle(4, "/data/a.txt");
        assert_eq!(ctx.current_path(), "/data/a.txt");
        ctx.record_rename("/data/b.txt".to_string());
        assert_eq!(ctx.current_path(), "/data/b.txt");
        assert_eq!(ctx.path, "/data/a.txt");
    }

    #[test]
    fn test_needs_backup_rules() {
        let mut ctx = HandleContext::for_handle(4, "/data/a.txt");
        assert!(!ctx.needs_backup(), "unknown preexistence");

        ctx.preexisting = true;
        ctx.size_at_open = 10;
        assert!(ctx.needs_backup());

        ctx.created = true;
        assert!(!ctx.needs_backup(), "created files are never backed up");
        ctx.created = false;

        ctx.deleted = true;
        assert!(!ctx.needs_backup());
        ctx.deleted = false;

        ctx.backup_id = Some(crate::backup::path_hash("/data/a.txt"));
        assert!(!ctx.needs_backup());
    }

    #[test]
    fn test_empty_preexisting_file_needs_no_backup() {
        let mut ctx = HandleContext::for_handle(4, "/data/a.txt");
        ctx.preexisting = true;
        ctx.size_at_open = 0;
        assert!(!ctx.needs_backup());
    }

    #[test]
    fn test_write_counters_and_entropy() {
        let mut ctx = HandleContext::for_handle(4, "/data/a.txt");
        ctx.record_write(&[0u8; 64]);
        let uniform: Vec<u8> = (0..=255u8).collect();
        ctx.record_write(&uniform);
        assert_eq!(ctx.writes.ops, 2);
        assert_eq!(ctx.writes.bytes, 64 + 256);
        assert!((ctx.writes.entropy - 4.0).abs() < 1e-9);
        assert!(ctx.writes.first_at_ms.is_some());
        assert!(ctx.writes.last_at_ms >= ctx.writes.first_at_ms);
    }

    #[test]
    fn test_key_kind() {
        assert_eq!(ContextKey::Handle(1).kind(), ContextKind::StreamHandle);
        assert_eq!(ContextKey::File(1).kind(), ContextKind::File);
    }
}
