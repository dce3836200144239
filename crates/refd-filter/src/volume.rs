//! Local-directory volume driven through the pipeline.
//!
//! [`LocalVolume`] plays the host I/O stack for a directory tree: every call
//! builds an [`IoRequest`], runs pre-dispatch, performs the real `std::fs`
//! operation, then runs post-dispatch with the resulting status. Closing the
//! last handle on a path releases the file-level context as well.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{FilterError, Result};
use crate::host::HostFs;
use crate::pipeline::Pipeline;
use crate::request::{
    CreateDisposition, CreateInfo, CreateParams, FileId, FsControlCode, HandleId, IoRequest,
    IoStatus, OpParams, PageProtection, ReadParams, SectionSyncParams, SetInfoClass, SyncType,
    WriteParams,
};

/// Resolves a rename target the way the volume applies it: relative targets
/// land next to the source.
pub fn resolve_target(source: &str, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    match Path::new(source).parent() {
        Some(parent) => parent.join(target),
        None => target.to_path_buf(),
    }
}

/// [`HostFs`] backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalHost {
    handle_state: bool,
}

impl LocalHost {
    pub fn new() -> Self {
        Self { handle_state: true }
    }

    /// A host that refuses per-handle state, so nothing is ever tracked.
    pub fn without_handle_state() -> Self {
        Self {
            handle_state: false,
        }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostFs for LocalHost {
    fn supports_handle_state(&self, _req: &IoRequest) -> bool {
        self.handle_state
    }

    fn rename_target(&self, req: &IoRequest) -> Result<String> {
        match req.set_info_class() {
            Some(SetInfoClass::Rename { target, .. }) => Ok(resolve_target(&req.path, target)
                .to_string_lossy()
                .into_owned()),
            _ => Err(FilterError::InvalidRequest {
                reason: "not a rename request".to_string(),
            }),
        }
    }

    fn file_size(&self, path: &str) -> Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn process_image(&self, pid: u32) -> Option<String> {
        fs::read_link(format!("/proc/{}/exe", pid))
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }
}

struct OpenHandle {
    file: Arc<File>,
    file_id: FileId,
    /// Path the file object was opened under; keys the shared file entry.
    opened_as: String,
    path: String,
    pid: u32,
    delete_pending: bool,
}

struct SharedFile {
    id: FileId,
    handles: usize,
}

pub struct LocalVolume {
    pipeline: Arc<Pipeline>,
    handles: DashMap<HandleId, OpenHandle>,
    files: DashMap<String, SharedFile>,
    next_id: AtomicU64,
}

impl LocalVolume {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            handles: DashMap::new(),
            files: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Pre-dispatch, the real operation, then post-dispatch with its status.
    fn run(
        &self,
        mut req: IoRequest,
        op: impl FnOnce(&mut IoRequest) -> io::Result<u64>,
    ) -> Result<IoRequest> {
        let (completed, ctx) = self.pipeline.pre_operation(&req).into_parts();
        if let Some(status) = completed {
            return match status {
                IoStatus::Failed { errno } => Err(FilterError::Denied { errno }),
                status => {
                    req.status = status;
                    Ok(req)
                }
            };
        }

        let result = op(&mut req);
        req.status = match &result {
            Ok(information) => IoStatus::Success {
                information: *information,
            },
            Err(e) => IoStatus::Failed {
                errno: e.raw_os_error().unwrap_or(libc::EIO),
            },
        };
        self.pipeline.post_operation(&req, ctx);

        result?;
        Ok(req)
    }

    fn handle(&self, handle: HandleId) -> Result<(Arc<File>, FileId, String, u32)> {
        let open = self
            .handles
            .get(&handle)
            .ok_or(FilterError::UnknownHandle { handle })?;
        Ok((open.file.clone(), open.file_id, open.path.clone(), open.pid))
    }

    fn acquire_file(&self, path: &str) -> FileId {
        self.files
            .entry(path.to_string())
            .or_insert_with(|| SharedFile {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                handles: 0,
            })
            .id
    }

    /// Drops one handle reference; returns the file id if it was the last.
    fn release_file_ref(&self, path: &str) -> Option<FileId> {
        let last = {
            let mut shared = self.files.get_mut(path)?;
            shared.handles = shared.handles.saturating_sub(1);
            shared.handles == 0
        };
        if !last {
            return None;
        }
        self.files
            .remove_if(path, |_, f| f.handles == 0)
            .map(|(_, f)| f.id)
    }

    pub fn open(&self, pid: u32, path: impl AsRef<Path>, params: CreateParams) -> Result<HandleId> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let handle = self.next_id.fetch_add(1, Ordering::Relaxed);
        let file_id = self.acquire_file(&path);

        let mut opened = None;
        let req = IoRequest::create(pid, path.clone(), params.clone()).on_handle(handle, file_id);
        let result = self.run(req, |req| {
            let existed = Path::new(&req.path).exists();
            let (file, info) = open_with(&req.path, &params, existed)?;
            opened = Some(file);
            Ok(info.as_information())
        });

        let file = match (result, opened) {
            (Ok(_), Some(file)) => file,
            (result, _) => {
                self.files.remove_if(&path, |_, f| f.handles == 0);
                result?;
                return Err(FilterError::InvalidRequest {
                    reason: "open completed without a file".to_string(),
                });
            }
        };

        if let Some(mut shared) = self.files.get_mut(&path) {
            shared.handles += 1;
        }
        self.handles.insert(
            handle,
            OpenHandle {
                file: Arc::new(file),
                file_id,
                opened_as: path.clone(),
                path,
                pid,
                delete_pending: params.delete_on_close,
            },
        );
        debug!(handle, file_id, pid, "handle opened");
        Ok(handle)
    }

    pub fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        let (file, file_id, path, pid) = self.handle(handle)?;
        let req = IoRequest::write(
            pid,
            path,
            WriteParams {
                offset,
                data: data.to_vec(),
                paging_io: false,
            },
        )
        .on_handle(handle, file_id);

        let req = self.run(req, |_| write_at(&file, offset, data))?;
        Ok(req.status.information() as usize)
    }

    /// Writes through a memory mapping: a writable section is created first,
    /// then the data reaches the file as a kernel paging write.
    pub fn write_mapped(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        let (file, file_id, path, pid) = self.handle(handle)?;

        let section = IoRequest::section_sync(
            pid,
            path.clone(),
            SectionSyncParams {
                sync_type: SyncType::CreateSection,
                protection: PageProtection::ReadWrite,
            },
        )
        .on_handle(handle, file_id);
        self.run(section, |_| Ok(0))?;

        let paging = IoRequest::write(
            pid,
            path,
            WriteParams {
                offset,
                data: data.to_vec(),
                paging_io: true,
            },
        )
        .on_handle(handle, file_id)
        .from_kernel();
        let req = self.run(paging, |_| write_at(&file, offset, data))?;
        Ok(req.status.information() as usize)
    }

    pub fn read(&self, handle: HandleId, offset: u64, length: usize) -> Result<Vec<u8>> {
        let (file, file_id, path, pid) = self.handle(handle)?;
        let req = IoRequest::read(
            pid,
            path,
            ReadParams {
                offset,
                length,
                paging_io: false,
                buffer: Vec::new(),
            },
        )
        .on_handle(handle, file_id);

        let mut req = self.run(req, |req| {
            let mut buf = vec![0u8; length];
            let mut f = &*file;
            f.seek(SeekFrom::Start(offset))?;
            let n = read_full(&mut f, &mut buf)?;
            buf.truncate(n);
            if let OpParams::Read(params) = &mut req.params {
                params.buffer = buf;
            }
            Ok(n as u64)
        })?;

        match &mut req.params {
            OpParams::Read(params) => Ok(std::mem::take(&mut params.buffer)),
            _ => Ok(Vec::new()),
        }
    }

    pub fn rename(&self, handle: HandleId, target: &str, replace_if_exists: bool) -> Result<()> {
        let (_, file_id, path, pid) = self.handle(handle)?;
        let destination = resolve_target(&path, target);

        let req = IoRequest::set_information(
            pid,
            path.clone(),
            SetInfoClass::Rename {
                target: target.to_string(),
                replace_if_exists,
            },
        )
        .on_handle(handle, file_id);
        self.run(req, |_| {
            if !replace_if_exists && destination.exists() {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            fs::rename(&path, &destination)?;
            Ok(0)
        })?;

        if let Some(mut open) = self.handles.get_mut(&handle) {
            open.path = destination.to_string_lossy().into_owned();
        }
        Ok(())
    }

    /// Marks the file for deletion when the handle closes, or clears the mark.
    pub fn set_delete(&self, handle: HandleId, delete: bool) -> Result<()> {
        let (_, file_id, path, pid) = self.handle(handle)?;
        let req = IoRequest::set_information(pid, path, SetInfoClass::Disposition { delete })
            .on_handle(handle, file_id);
        self.run(req, |_| Ok(0))?;

        if let Some(mut open) = self.handles.get_mut(&handle) {
            open.delete_pending = delete;
        }
        Ok(())
    }

    pub fn set_end_of_file(&self, handle: HandleId, size: u64) -> Result<()> {
        let (file, file_id, path, pid) = self.handle(handle)?;
        let req = IoRequest::set_information(pid, path, SetInfoClass::EndOfFile { size })
            .on_handle(handle, file_id);
        self.run(req, |_| {
            file.set_len(size)?;
            Ok(0)
        })?;
        Ok(())
    }

    /// Allocation is advisory here; only the request is dispatched.
    pub fn set_allocation(&self, handle: HandleId, size: u64) -> Result<()> {
        let (_, file_id, path, pid) = self.handle(handle)?;
        let req = IoRequest::set_information(pid, path, SetInfoClass::Allocation { size })
            .on_handle(handle, file_id);
        self.run(req, |_| Ok(0))?;
        Ok(())
    }

    pub fn set_valid_data_length(&self, handle: HandleId, length: u64) -> Result<()> {
        let (_, file_id, path, pid) = self.handle(handle)?;
        let req = IoRequest::set_information(pid, path, SetInfoClass::ValidDataLength { length })
            .on_handle(handle, file_id);
        self.run(req, |_| Ok(0))?;
        Ok(())
    }

    /// Dispatches a control code. Its data effects are not emulated.
    pub fn fs_control(&self, handle: HandleId, code: FsControlCode) -> Result<()> {
        let (_, file_id, path, pid) = self.handle(handle)?;
        let req = IoRequest::fs_control(pid, path, code).on_handle(handle, file_id);
        self.run(req, |_| Ok(0))?;
        Ok(())
    }

    /// Closes the handle, applying a pending delete, then releases its
    /// context and the file-level context if this was the last handle.
    pub fn close(&self, handle: HandleId) -> Result<()> {
        let (_, open) = self
            .handles
            .remove(&handle)
            .ok_or(FilterError::UnknownHandle { handle })?;
        drop(open.file);

        if open.delete_pending {
            match fs::remove_file(&open.path) {
                Ok(()) => debug!(handle, path = %open.path, "deleted on close"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(handle, path = %open.path, error = %e, "delete on close failed"),
            }
        }

        self.pipeline.release_handle(handle);
        if let Some(file_id) = self.release_file_ref(&open.opened_as) {
            self.pipeline.release_file(file_id);
        }
        debug!(handle, file_id = open.file_id, "handle closed");
        Ok(())
    }
}

fn open_with(path: &str, params: &CreateParams, existed: bool) -> io::Result<(File, CreateInfo)> {
    let access = params.access;
    let mut opts = OpenOptions::new();
    let replaces = params.disposition != CreateDisposition::Open;
    opts.read(access.read || !(access.write || access.append))
        .write(access.write || (replaces && !access.append))
        .append(access.append);

    let info = match params.disposition {
        CreateDisposition::Open => CreateInfo::Opened,
        CreateDisposition::Create => {
            opts.create_new(true);
            CreateInfo::Created
        }
        CreateDisposition::OpenIf => {
            opts.create(true);
            if existed {
                CreateInfo::Opened
            } else {
                CreateInfo::Created
            }
        }
        CreateDisposition::Overwrite => {
            opts.truncate(true);
            CreateInfo::Overwritten
        }
        CreateDisposition::OverwriteIf => {
            opts.create(true).truncate(true);
            if existed {
                CreateInfo::Overwritten
            } else {
                CreateInfo::Created
            }
        }
        CreateDisposition::Supersede => {
            opts.create(true).truncate(true);
            if existed {
                CreateInfo::Superseded
            } else {
                CreateInfo::Created
            }
        }
    };

    Ok((opts.open(path)?, info))
}

fn write_at(file: &File, offset: u64, data: &[u8]) -> io::Result<u64> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)?;
    Ok(data.len() as u64)
}

fn read_full(f: &mut &File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match f.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Message;
    use crate::config::FilterConfig;
    use crate::request::Access;
    use std::time::Duration;
    use tempfile::TempDir;

    fn volume(dir: &TempDir) -> LocalVolume {
        let mut config = FilterConfig::with_backup_root(dir.path().join("backups"));
        config.channel.queue_depth = 16;
        config.channel.send_timeout_ms = 100;
        let pipeline = Pipeline::builder(config, Arc::new(LocalHost::new()))
            .build()
            .unwrap();
        pipeline.start().unwrap();
        LocalVolume::new(Arc::new(pipeline))
    }

    fn rw() -> CreateParams {
        CreateParams {
            access: Access::read_write(),
            ..CreateParams::default()
        }
    }

    #[test]
    fn test_resolve_relative_target() {
        assert_eq!(
            resolve_target("/data/docs/a.txt", "a.txt.locked"),
            PathBuf::from("/data/docs/a.txt.locked")
        );
        assert_eq!(
            resolve_target("/data/docs/a.txt", "/other/b.txt"),
            PathBuf::from("/other/b.txt")
        );
    }

    #[test]
    fn test_local_host_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"12345").unwrap();
        let host = LocalHost::new();
        assert_eq!(host.file_size(&path.to_string_lossy()).unwrap(), Some(5));
        assert_eq!(host.file_size(&dir.path().to_string_lossy()).unwrap(), None);
        assert_eq!(
            host.file_size(&dir.path().join("missing").to_string_lossy())
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_local_host_process_image() {
        let host = LocalHost::new();
        let image = host.process_image(std::process::id()).unwrap();
        assert!(Path::new(&image).is_absolute());
        assert!(host.process_image(u32::MAX).is_none());
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello world").unwrap();

        let h = vol.open(10, &path, rw()).unwrap();
        assert_eq!(vol.write(h, 6, b"there").unwrap(), 5);
        assert_eq!(vol.read(h, 0, 64).unwrap(), b"hello there");
        vol.close(h).unwrap();
        assert_eq!(vol.open_handles(), 0);
    }

    #[test]
    fn test_unknown_handle() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        assert!(matches!(
            vol.write(99, 0, b"x"),
            Err(FilterError::UnknownHandle { handle: 99 })
        ));
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        let err = vol.open(1, dir.path().join("nope"), rw()).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert!(vol.pipeline().contexts().is_empty());
    }

    #[test]
    fn test_delete_on_close_removes_file() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        let port = vol.pipeline().connect().unwrap();
        let path = dir.path().join("victim.txt");
        fs::write(&path, b"precious").unwrap();

        let h = vol.open(10, &path, rw()).unwrap();
        vol.set_delete(h, true).unwrap();
        vol.close(h).unwrap();
        assert!(!path.exists());

        let Some(Message::Event(record)) = port.recv_timeout(Duration::from_secs(1)).unwrap()
        else {
            panic!("expected an event");
        };
        assert!(record.flags.deleted);
        let id = crate::backup::path_hash(&path.to_string_lossy());
        assert_eq!(record.backup_id, id.to_string());
        assert_eq!(vol.pipeline().backups().read(id).unwrap(), b"precious");
    }

    #[test]
    fn test_rename_updates_handle_path() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        let path = dir.path().join("a.txt");
        fs::write(&path, b"data").unwrap();

        let h = vol.open(10, &path, rw()).unwrap();
        vol.rename(h, "b.txt", false).unwrap();
        vol.write(h, 0, b"DATA").unwrap();
        vol.close(h).unwrap();

        assert!(!path.exists());
        assert_eq!(fs::read(dir.path().join("b.txt")).unwrap(), b"DATA");
    }

    #[test]
    fn test_rename_refuses_existing_target() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        let path = dir.path().join("a.txt");
        fs::write(&path, b"a").unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let h = vol.open(10, &path, rw()).unwrap();
        assert!(vol.rename(h, "b.txt", false).is_err());
        let ctx = vol
            .pipeline()
            .contexts()
            .snapshot(crate::context::ContextKey::Handle(h))
            .unwrap();
        assert!(!ctx.renamed);
    }

    #[test]
    fn test_mapped_write_reports_mmap_modified() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        let port = vol.pipeline().connect().unwrap();
        let path = dir.path().join("mapped.bin");
        fs::write(&path, b"0000").unwrap();

        let h = vol.open(10, &path, rw()).unwrap();
        vol.write_mapped(h, 0, b"1111").unwrap();

        let Some(Message::Event(record)) = port.try_recv().unwrap() else {
            panic!("expected the mapping event");
        };
        assert!(record.flags.mmap_modified);
        assert!(record.backup_id.is_empty());

        vol.close(h).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"1111");
    }

    #[test]
    fn test_last_close_releases_file_context() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        let path = dir.path().join("shared.bin");
        fs::write(&path, b"0000").unwrap();

        let a = vol.open(10, &path, rw()).unwrap();
        let b = vol.open(10, &path, rw()).unwrap();
        let section = IoRequest::section_sync(
            10,
            path.to_string_lossy(),
            SectionSyncParams {
                sync_type: SyncType::CreateSection,
                protection: PageProtection::ReadWrite,
            },
        );
        let (_, file_id, _, _) = vol.handle(a).unwrap();
        vol.run(section.on_handle(a, file_id), |_| Ok(0)).unwrap();

        let file_key = crate::context::ContextKey::File(file_id);
        vol.close(a).unwrap();
        assert!(vol.pipeline().contexts().contains(file_key));
        vol.close(b).unwrap();
        assert!(!vol.pipeline().contexts().contains(file_key));
    }
}
