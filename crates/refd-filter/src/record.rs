//! Event record sent to the consumer when a handle context is finalized.
//!
//! Full layout, little-endian, fixed size [`EVENT_RECORD_WIRE_SIZE`]:
//!
//! ```text
//! 0     u32          requestor pid
//! 4     u8 x 12      flags (0 or 1), in EventFlags field order
//! 16    u64 x 5      read bytes, write bytes, read ops, write ops, size at open
//! 56    f64 x 2      read entropy, write entropy
//! 72    u16 x 1040   path, NUL padded
//!       u16 x 1040   new path
//!       u16 x 1040   backup id
//! ```
//!
//! The path-only layout is the UTF-16 code units of one path followed by a NUL.

use serde::{Deserialize, Serialize};

use crate::config::RecordFormat;
use crate::context::HandleContext;
use crate::error::{FilterError, Result};

/// Capacity of each wide path buffer, terminator included.
pub const MAX_PATH_CHARS: usize = 1040;
pub const FLAG_COUNT: usize = 12;

const FLAGS_OFFSET: usize = 4;
const COUNTERS_OFFSET: usize = FLAGS_OFFSET + FLAG_COUNT;
const PATHS_OFFSET: usize = COUNTERS_OFFSET + 7 * 8;
const WIDE_FIELD_LEN: usize = MAX_PATH_CHARS * 2;

pub const EVENT_RECORD_WIRE_SIZE: usize = PATHS_OFFSET + 3 * WIDE_FIELD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventFlags {
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
    pub mmap_modified: bool,
}

impl EventFlags {
    fn to_array(self) -> [bool; FLAG_COUNT] {
        [
            self.created,
            self.modified,
            self.deleted,
            self.renamed,
            self.read,
            self.alloc,
            self.eof,
            self.valid_data_len,
            self.fsctl_offload_write,
            self.fsctl_write_raw_encrypted,
            self.fsctl_set_zero_data,
            self.mmap_modified,
        ]
    }

    fn from_array(a: [bool; FLAG_COUNT]) -> Self {
        Self {
            created: a[0],
            modified: a[1],
            deleted: a[2],
            renamed: a[3],
            read: a[4],
            alloc: a[5],
            eof: a[6],
            valid_data_len: a[7],
            fsctl_offload_write: a[8],
            fsctl_write_raw_encrypted: a[9],
            fsctl_set_zero_data: a[10],
            mmap_modified: a[11],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EventCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub size_at_open: u64,
    pub read_entropy: f64,
    pub write_entropy: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventRecord {
    pub requestor_pid: u32,
    pub flags: EventFlags,
    pub counters: EventCounters,
    pub path: String,
    /// Empty unless the handle renamed the file.
    pub new_path: String,
    /// Empty unless a snapshot was taken.
    pub backup_id: String,
}

impl EventRecord {
    pub fn from_context(ctx: &HandleContext) -> Self {
        Self {
            requestor_pid: ctx.requestor_pid,
            flags: EventFlags {
                created: ctx.created,
                modified: ctx.modified,
                deleted: ctx.deleted,
                renamed: ctx.renamed,
                read: ctx.read,
                alloc: ctx.alloc,
                eof: ctx.eof,
                valid_data_len: ctx.valid_data_len,
                fsctl_offload_write: ctx.fsctl_offload_write,
                fsctl_write_raw_encrypted: ctx.fsctl_write_raw_encrypted,
                fsctl_set_zero_data: ctx.fsctl_set_zero_data,
                mmap_modified: ctx.mmap_modified,
            },
            counters: EventCounters {
                read_bytes: ctx.reads.bytes,
                write_bytes: ctx.writes.bytes,
                read_ops: ctx.reads.ops,
                write_ops: ctx.writes.ops,
                size_at_open: ctx.size_at_open,
                read_entropy: ctx.reads.entropy,
                write_entropy: ctx.writes.entropy,
            },
            path: ctx.path.clone(),
            new_path: ctx.new_path.clone().unwrap_or_default(),
            backup_id: ctx.backup_id.map(|id| id.to_string()).unwrap_or_default(),
        }
    }

    /// The path a path-only consumer sees: the rename target if there is one.
    pub fn effective_path(&self) -> &str {
        if self.flags.renamed && !self.new_path.is_empty() {
            &self.new_path
        } else {
            &self.path
        }
    }

    /// Whether a consumer using `format` is sent this record. Path-only
    /// consumers are not told about files that no longer exist.
    pub fn is_delivered_as(&self, format: RecordFormat) -> bool {
        match format {
            RecordFormat::Full => true,
            RecordFormat::PathOnly => !self.flags.deleted,
        }
    }

    pub fn encode_as(&self, format: RecordFormat) -> Result<Vec<u8>> {
        match format {
            RecordFormat::Full => self.encode(),
            RecordFormat::PathOnly => encode_path_only(self.effective_path()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(EVENT_RECORD_WIRE_SIZE);
        buf.extend_from_slice(&self.requestor_pid.to_le_bytes());
        buf.extend(self.flags.to_array().iter().map(|&f| f as u8));

        let c = &self.counters;
        for v in [c.read_bytes, c.write_bytes, c.read_ops, c.write_ops, c.size_at_open] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&c.read_entropy.to_le_bytes());
        buf.extend_from_slice(&c.write_entropy.to_le_bytes());

        put_wide(&mut buf, &self.path);
        put_wide(&mut buf, &self.new_path);
        put_wide(&mut buf, &self.backup_id);

        debug_assert_eq!(buf.len(), EVENT_RECORD_WIRE_SIZE);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != EVENT_RECORD_WIRE_SIZE {
            return Err(FilterError::InvalidRecord {
                reason: format!(
                    "expected {} bytes, got {}",
                    EVENT_RECORD_WIRE_SIZE,
                    bytes.len()
                ),
            });
        }

        let requestor_pid = u32::from_le_bytes(le_array(&bytes[0..FLAGS_OFFSET]));

        let mut flags = [false; FLAG_COUNT];
        for (i, &b) in bytes[FLAGS_OFFSET..COUNTERS_OFFSET].iter().enumerate() {
            flags[i] = match b {
                0 => false,
                1 => true,
                other => {
                    return Err(FilterError::InvalidRecord {
                        reason: format!("flag {} has invalid value {}", i, other),
                    })
                }
            };
        }

        let word = |i: usize| -> [u8; 8] {
            let start = COUNTERS_OFFSET + i * 8;
            le_array(&bytes[start..start + 8])
        };
        let counters = EventCounters {
            read_bytes: u64::from_le_bytes(word(0)),
            write_bytes: u64::from_le_bytes(word(1)),
            read_ops: u64::from_le_bytes(word(2)),
            write_ops: u64::from_le_bytes(word(3)),
            size_at_open: u64::from_le_bytes(word(4)),
            read_entropy: f64::from_le_bytes(word(5)),
            write_entropy: f64::from_le_bytes(word(6)),
        };

        let field = |i: usize| {
            let start = PATHS_OFFSET + i * WIDE_FIELD_LEN;
            decode_units(&bytes[start..start + WIDE_FIELD_LEN])
        };

        Ok(Self {
            requestor_pid,
            flags: EventFlags::from_array(flags),
            counters,
            path: field(0)?,
            new_path: field(1)?,
            backup_id: field(2)?,
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// UTF-16 units of `s`, cut to fit a wide buffer with its NUL. A cut never
/// leaves a dangling high surrogate.
fn wide_units(s: &str) -> Vec<u16> {
    let mut units: Vec<u16> = s.encode_utf16().take(MAX_PATH_CHARS).collect();
    if units.len() == MAX_PATH_CHARS {
        units.truncate(MAX_PATH_CHARS - 1);
        if units.last().is_some_and(|u| (0xD800..0xDC00).contains(u)) {
            units.pop();
        }
    }
    units
}

fn put_wide(buf: &mut Vec<u8>, s: &str) {
    let units = wide_units(s);
    for u in &units {
        buf.extend_from_slice(&u.to_le_bytes());
    }
    buf.resize(buf.len() + (MAX_PATH_CHARS - units.len()) * 2, 0);
}

fn decode_units(bytes: &[u8]) -> Result<String> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let Some(end) = units.iter().position(|&u| u == 0) else {
        return Err(FilterError::InvalidRecord {
            reason: "wide string is not NUL terminated".to_string(),
        });
    };
    String::from_utf16(&units[..end]).map_err(|e| FilterError::InvalidRecord {
        reason: e.to_string(),
    })
}

pub fn encode_path_only(path: &str) -> Result<Vec<u8>> {
    let units = wide_units(path);
    let mut buf = Vec::with_capacity((units.len() + 1) * 2);
    for u in units.iter().chain(std::iter::once(&0)) {
        buf.extend_from_slice(&u.to_le_bytes());
    }
    Ok(buf)
}

pub fn decode_path_only(bytes: &[u8]) -> Result<String> {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return Err(FilterError::InvalidRecord {
            reason: format!("path message has odd or short length {}", bytes.len()),
        });
    }
    decode_units(bytes)
}
