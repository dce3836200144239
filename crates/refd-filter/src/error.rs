use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backup source is empty: {path}")]
    BackupSourceEmpty { path: String },

    #[error("Short write to backup {backup_id}: wrote {written} of {expected} bytes")]
    BackupShortWrite {
        backup_id: String,
        written: usize,
        expected: usize,
    },

    #[error("No consumer connected to channel {name}")]
    ChannelNotConnected { name: String },

    #[error("Channel {name} already has a connected consumer")]
    ChannelAlreadyConnected { name: String },

    #[error("Send on channel {name} timed out after {timeout_ms} ms")]
    ChannelTimeout { name: String, timeout_ms: u64 },

    #[error("Consumer on channel {name} disconnected")]
    ChannelDisconnected { name: String },

    #[error("Invalid event record: {reason}")]
    InvalidRecord { reason: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("Unknown handle: {handle}")]
    UnknownHandle { handle: u64 },

    #[error("Operation denied with status {errno}")]
    Denied { errno: i32 },
}

pub type Result<T> = std::result::Result<T, FilterError>;

impl FilterError {
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FilterError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            FilterError::BackupSourceEmpty { .. } => ENODATA,
            FilterError::BackupShortWrite { .. } => EIO,
            FilterError::ChannelNotConnected { .. } => ENOTCONN,
            FilterError::ChannelAlreadyConnected { .. } => EISCONN,
            FilterError::ChannelTimeout { .. } => ETIMEDOUT,
            FilterError::ChannelDisconnected { .. } => EPIPE,
            FilterError::InvalidRecord { .. } => EINVAL,
            FilterError::InvalidRequest { .. } => EINVAL,
            FilterError::InvalidConfig { .. } => EINVAL,
            FilterError::NotRunning => ESHUTDOWN,
            FilterError::UnknownHandle { .. } => EBADF,
            FilterError::Denied { errno } => *errno,
        }
    }

    /// True when the error reports a lost creation race, which callers treat as success.
    pub fn is_race(&self) -> bool {
        matches!(self, FilterError::Io(e) if e.kind() == std::io::ErrorKind::AlreadyExists)
    }

    /// True for channel delivery failures; the event is dropped and the pipeline continues.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            FilterError::ChannelNotConnected { .. }
                | FilterError::ChannelTimeout { .. }
                | FilterError::ChannelDisconnected { .. }
        )
    }
}
