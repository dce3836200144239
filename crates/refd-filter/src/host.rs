use crate::error::Result;
use crate::request::IoRequest;

/// Queries the policy handlers make against the host I/O stack.
pub trait HostFs: Send + Sync {
    /// Whether per-handle state can be attached for this request's file object.
    fn supports_handle_state(&self, req: &IoRequest) -> bool;

    /// Normalized destination of a rename request, independent of the raw
    /// target buffer the caller supplied.
    fn rename_target(&self, req: &IoRequest) -> Result<String>;

    /// Size of the file at `path`, or `None` when it does not exist.
    fn file_size(&self, path: &str) -> Result<Option<u64>>;

    /// Executable image of the requesting process, when the host can tell.
    fn process_image(&self, pid: u32) -> Option<String>;
}
