//! Filter configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::record::MAX_PATH_CHARS;

/// Wire shape of records sent to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RecordFormat {
    /// Fixed-size record with flags, counters and three path buffers.
    #[default]
    Full,
    /// A single NUL-terminated UTF-16 path.
    PathOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub root: PathBuf,
    /// Directory for in-progress snapshots; defaults to the sibling
    /// `<root>.staging` so the root holds only finished backups.
    pub staging_dir: Option<PathBuf>,
    pub window_bytes: u64,
}

impl BackupConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        if let Some(dir) = &self.staging_dir {
            return dir.clone();
        }
        match self.root.file_name() {
            Some(name) => {
                let mut name = name.to_os_string();
                name.push(".staging");
                self.root.with_file_name(name)
            }
            None => self.root.join(".staging"),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/refd/backups"),
            staging_dir: None,
            window_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    pub send_timeout_ms: u64,
    /// Records buffered ahead of the consumer; zero means hand-off.
    pub queue_depth: usize,
    pub record_format: RecordFormat,
}

impl ChannelConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "\\refd_port".to_string(),
            send_timeout_ms: 15_000,
            queue_depth: 0,
            record_format: RecordFormat::Full,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_path_chars: usize,
    pub excluded_prefixes: Vec<String>,
    pub excluded_suffixes: Vec<String>,
    pub track_reads: bool,
    pub case_insensitive: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_path_chars: MAX_PATH_CHARS,
            excluded_prefixes: Vec::new(),
            excluded_suffixes: vec!["refd-filter.log".to_string()],
            track_reads: true,
            case_insensitive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FilterConfig {
    pub backup: BackupConfig,
    pub channel: ChannelConfig,
    pub policy: PolicyConfig,
}

impl FilterConfig {
    pub fn with_backup_root(root: impl Into<PathBuf>) -> Self {
        Self {
            backup: BackupConfig::new(root),
            ..Self::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: FilterConfig =
            toml::from_str(contents).map_err(|e| FilterError::InvalidConfig {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup.window_bytes == 0 {
            return Err(FilterError::InvalidConfig {
                reason: "backup window must be at least one byte".to_string(),
            });
        }

        if self.backup.root.as_os_str().is_empty() {
            return Err(FilterError::InvalidConfig {
                reason: "backup root must be set".to_string(),
            });
        }

        if self.channel.name.is_empty() {
            return Err(FilterError::InvalidConfig {
                reason: "channel name must not be empty".to_string(),
            });
        }

        if self.channel.send_timeout_ms == 0 {
            return Err(FilterError::InvalidConfig {
                reason: "channel send timeout must be non-zero".to_string(),
            });
        }

        if self.policy.max_path_chars == 0 || self.policy.max_path_chars > MAX_PATH_CHARS {
            return Err(FilterError::InvalidConfig {
                reason: format!(
                    "max_path_chars must be between 1 and {}",
                    MAX_PATH_CHARS
                ),
            });
        }

        Ok(())
    }
}
