use libc::c_int;
use n0_error::stack_error;

/// Kernel-visible error taxonomy for filesystem node operations.
///
/// Every node operation funnels failures into one of these kinds; the
/// filesystem server converts them to errno values at the FUSE boundary.
#[stack_error(derive)]
pub enum FsError {
    /// Unknown child name, stale queue index, or missing header.
    NotFound,
    /// Write to a read-only node, or add/remove on a fixed schema.
    PermissionDenied,
    /// Unparseable text for a typed file, or malformed wire-form input.
    OutOfRange,
    /// Serialization failure while rendering a raw or body dump.
    NoData,
}

impl FsError {
    /// Returns the errno value surfaced to the kernel operation.
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EPERM,
            FsError::OutOfRange => libc::ERANGE,
            FsError::NoData => libc::ENODATA,
        }
    }
}

/// Result alias for filesystem node operations.
pub type FsResult<T> = std::result::Result<T, FsError>;
