//! Path-addressed backup snapshots.
//!
//! A snapshot preserves the first and last `window_bytes` of a file (the
//! whole file when it is at most twice the window) under
//! `<root>/<decimal path hash>`. A snapshot is never overwritten; an existing
//! destination is the completion signal, so concurrent callers racing on the
//! same source all succeed.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BackupConfig;
use crate::error::{FilterError, Result};

const HASH_MULTIPLIER: u64 = 65535;
const HASH_MODULUS: u64 = 10_000_000_007;

/// Name of a snapshot, derived from the source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(u64);

impl BackupId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rolling hash over the UTF-16 code units of `path`.
pub fn path_hash(path: &str) -> BackupId {
    let hash = path.encode_utf16().fold(0u64, |h, c| {
        h.wrapping_add(h.wrapping_mul(HASH_MULTIPLIER).wrapping_add(c as u64) % HASH_MODULUS)
    });
    BackupId(hash)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    /// This call wrote the snapshot.
    Created,
    /// A snapshot for the path already existed.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub id: BackupId,
    pub outcome: BackupOutcome,
}

fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV) || e.kind() == io::ErrorKind::Unsupported
}

fn write_window(file: &mut File, data: &[u8], id: BackupId) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(0) => {
                return Err(FilterError::BackupShortWrite {
                    backup_id: id.to_string(),
                    written,
                    expected: data.len(),
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub struct BackupStore {
    root: PathBuf,
    staging: PathBuf,
    window: u64,
    staged: AtomicU64,
}

impl BackupStore {
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            root: config.root.clone(),
            staging: config.staging_dir(),
            window: config.window_bytes,
            staged: AtomicU64::new(0),
        }
    }

    /// Creates the backup and staging directories.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.staging)?;
        debug!(root = %self.root.display(), staging = %self.staging.display(), "backup store ready");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    pub fn window_bytes(&self) -> u64 {
        self.window
    }

    pub fn path_for(&self, id: BackupId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn exists(&self, id: BackupId) -> bool {
        self.path_for(id).exists()
    }

    pub fn read(&self, id: BackupId) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_for(id))?)
    }

    /// True when `path` lies inside the backup or staging directory.
    pub fn owns(&self, path: &Path) -> bool {
        path.starts_with(&self.root) || path.starts_with(&self.staging)
    }

    pub fn backup(&self, source: &str) -> Result<Snapshot> {
        let id = path_hash(source);
        let dest = self.path_for(id);

        if dest.try_exists()? {
            debug!(source, backup_id = %id, "backup already present");
            return Ok(Snapshot {
                id,
                outcome: BackupOutcome::AlreadyPresent,
            });
        }

        let window = self.read_window(Path::new(source))?;

        let created = match self.create_staged(id, &dest, &window) {
            Err(FilterError::Io(e)) if is_cross_device(&e) => {
                warn!(
                    source,
                    backup_id = %id,
                    error = %e,
                    "staged backup crosses volumes, writing in place"
                );
                self.create_in_place(id, &dest, &window)
            }
            other => other,
        };

        match created {
            Ok(()) => {
                debug!(source, backup_id = %id, bytes = window.len(), "backup written");
                Ok(Snapshot {
                    id,
                    outcome: BackupOutcome::Created,
                })
            }
            Err(e) if e.is_race() => {
                debug!(source, backup_id = %id, "lost backup creation race");
                Ok(Snapshot {
                    id,
                    outcome: BackupOutcome::AlreadyPresent,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn read_window(&self, source: &Path) -> Result<Vec<u8>> {
        let mut file = File::open(source)?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Err(FilterError::BackupSourceEmpty {
                path: source.display().to_string(),
            });
        }

        if size <= self.window.saturating_mul(2) {
            let mut buf = Vec::with_capacity(size as usize);
            file.take(size).read_to_end(&mut buf)?;
            return Ok(buf);
        }

        let n = self.window as usize;
        let mut buf = vec![0u8; n * 2];
        file.read_exact(&mut buf[..n])?;
        file.seek(SeekFrom::Start(size - self.window))?;
        file.read_exact(&mut buf[n..])?;
        Ok(buf)
    }

    /// Writes into a staging file, then links it into place. The link never
    /// replaces an existing destination.
    fn create_staged(&self, id: BackupId, dest: &Path, data: &[u8]) -> Result<()> {
        let seq = self.staged.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .staging
            .join(format!("{}.{}.{}.tmp", id, std::process::id(), seq));

        let result = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(FilterError::from)
            .and_then(|mut file| write_window(&mut file, data, id))
            .and_then(|()| fs::hard_link(&tmp, dest).map_err(FilterError::from));

        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "failed to remove staging file");
            }
        }

        result
    }

    fn create_in_place(&self, id: BackupId, dest: &Path, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(dest)?;
        if let Err(e) = write_window(&mut file, data, id) {
            drop(file);
            let _ = fs::remove_file(dest);
            return Err(e);
        }
        Ok(())
    }
}
