//! I/O request model handed to the dispatcher by the host.
//!
//! A request carries the operation code, the identity of the open handle and
//! of the underlying file, the requestor, the target path, per-operation
//! parameters, and (after the real operation ran) its completion status.

use serde::{Deserialize, Serialize};

/// Identifies one open handle (one file object).
pub type HandleId = u64;

/// Identifies the underlying file shared by all handles opened on it.
pub type FileId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Create,
    Read,
    Write,
    SetInformation,
    AcquireForSectionSync,
    FileSystemControl,
    Cleanup,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RequestorMode {
    #[default]
    User,
    Kernel,
}

/// Access requested at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub delete: bool,
}

impl Access {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    pub fn append() -> Self {
        Self {
            append: true,
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }

    pub fn is_modifying(&self) -> bool {
        self.write || self.append || self.delete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CreateDisposition {
    Supersede,
    #[default]
    Open,
    Create,
    OpenIf,
    Overwrite,
    OverwriteIf,
}

impl CreateDisposition {
    /// Dispositions that truncate or replace an existing file.
    pub fn destroys_existing(&self) -> bool {
        matches!(
            self,
            CreateDisposition::Supersede
                | CreateDisposition::Overwrite
                | CreateDisposition::OverwriteIf
        )
    }
}

/// Outcome of a successful create, carried in the status information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateInfo {
    Superseded,
    Opened,
    Created,
    Overwritten,
}

impl CreateInfo {
    pub fn as_information(self) -> u64 {
        match self {
            CreateInfo::Superseded => 0,
            CreateInfo::Opened => 1,
            CreateInfo::Created => 2,
            CreateInfo::Overwritten => 3,
        }
    }

    pub fn from_information(information: u64) -> Option<Self> {
        match information {
            0 => Some(CreateInfo::Superseded),
            1 => Some(CreateInfo::Opened),
            2 => Some(CreateInfo::Created),
            3 => Some(CreateInfo::Overwritten),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateParams {
    pub access: Access,
    pub disposition: CreateDisposition,
    pub delete_on_close: bool,
    pub directory: bool,
    pub open_target_directory: bool,
    pub paging_file: bool,
    pub volume_open: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteParams {
    pub offset: u64,
    pub data: Vec<u8>,
    /// Write issued by the memory manager for a mapped view.
    pub paging_io: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadParams {
    pub offset: u64,
    pub length: usize,
    pub paging_io: bool,
    /// Filled by the host once the read completed.
    pub buffer: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetInfoClass {
    /// Raw caller-supplied target; handlers resolve it through the host.
    Rename { target: String, replace_if_exists: bool },
    Disposition { delete: bool },
    Allocation { size: u64 },
    EndOfFile { size: u64 },
    ValidDataLength { length: u64 },
    Basic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageProtection {
    #[default]
    ReadOnly,
    ReadWrite,
    ExecuteRead,
    ExecuteReadWrite,
    WriteCopy,
}

impl PageProtection {
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            PageProtection::ReadWrite | PageProtection::ExecuteReadWrite
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncType {
    #[default]
    CreateSection,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionSyncParams {
    pub sync_type: SyncType,
    pub protection: PageProtection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsControlCode {
    OffloadWrite,
    WriteRawEncrypted,
    SetZeroData,
    Other(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OpParams {
    Create(CreateParams),
    Read(ReadParams),
    Write(WriteParams),
    SetInformation(SetInfoClass),
    SectionSync(SectionSyncParams),
    FsControl(FsControlCode),
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStatus {
    #[default]
    Pending,
    Success { information: u64 },
    Failed { errno: i32 },
}

impl IoStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, IoStatus::Success { .. })
    }

    pub fn information(&self) -> u64 {
        match self {
            IoStatus::Success { information } => *information,
            _ => 0,
        }
    }
}

/// Flags the host passes to post-operation dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostFlags {
    /// Set when the pipeline is being detached and pending requests are drained.
    pub draining: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    pub op: OpCode,
    pub handle: Option<HandleId>,
    pub file: Option<FileId>,
    pub requestor_pid: u32,
    pub requestor_mode: RequestorMode,
    /// A filesystem-internal request already owns the top-level slot.
    pub nested: bool,
    pub path: String,
    pub params: OpParams,
    pub status: IoStatus,
}

impl IoRequest {
    pub fn new(op: OpCode, requestor_pid: u32, path: impl Into<String>, params: OpParams) -> Self {
        Self {
            op,
            handle: None,
            file: None,
            requestor_pid,
            requestor_mode: RequestorMode::User,
            nested: false,
            path: path.into(),
            params,
            status: IoStatus::Pending,
        }
    }

    pub fn create(requestor_pid: u32, path: impl Into<String>, params: CreateParams) -> Self {
        Self::new(OpCode::Create, requestor_pid, path, OpParams::Create(params))
    }

    pub fn write(requestor_pid: u32, path: impl Into<String>, params: WriteParams) -> Self {
        Self::new(OpCode::Write, requestor_pid, path, OpParams::Write(params))
    }

    pub fn read(requestor_pid: u32, path: impl Into<String>, params: ReadParams) -> Self {
        Self::new(OpCode::Read, requestor_pid, path, OpParams::Read(params))
    }

    pub fn set_information(
        requestor_pid: u32,
        path: impl Into<String>,
        class: SetInfoClass,
    ) -> Self {
        Self::new(
            OpCode::SetInformation,
            requestor_pid,
            path,
            OpParams::SetInformation(class),
        )
    }

    pub fn section_sync(
        requestor_pid: u32,
        path: impl Into<String>,
        params: SectionSyncParams,
    ) -> Self {
        Self::new(
            OpCode::AcquireForSectionSync,
            requestor_pid,
            path,
            OpParams::SectionSync(params),
        )
    }

    pub fn fs_control(requestor_pid: u32, path: impl Into<String>, code: FsControlCode) -> Self {
        Self::new(
            OpCode::FileSystemControl,
            requestor_pid,
            path,
            OpParams::FsControl(code),
        )
    }

    pub fn on_handle(mut self, handle: HandleId, file: FileId) -> Self {
        self.handle = Some(handle);
        self.file = Some(file);
        self
    }

    pub fn from_kernel(mut self) -> Self {
        self.requestor_mode = RequestorMode::Kernel;
        self
    }

    pub fn create_params(&self) -> Option<&CreateParams> {
        match &self.params {
            OpParams::Create(p) => Some(p),
            _ => None,
        }
    }

    pub fn write_params(&self) -> Option<&WriteParams> {
        match &self.params {
            OpParams::Write(p) => Some(p),
            _ => None,
        }
    }

    pub fn read_params(&self) -> Option<&ReadParams> {
        match &self.params {
            OpParams::Read(p) => Some(p),
            _ => None,
        }
    }

    pub fn set_info_class(&self) -> Option<&SetInfoClass> {
        match &self.params {
            OpParams::SetInformation(c) => Some(c),
            _ => None,
        }
    }

    pub fn create_info(&self) -> Option<CreateInfo> {
        match (self.op, self.status) {
            (OpCode::Create, IoStatus::Success { information }) => {
                CreateInfo::from_information(information)
            }
            _ => None,
        }
    }

    pub fn is_paging_io(&self) -> bool {
        match &self.params {
            OpParams::Write(p) => p.paging_io,
            OpParams::Read(p) => p.paging_io,
            _ => false,
        }
    }
}
