//! Errors surfaced by the allocation layer.

use std::path::PathBuf;

use thiserror::Error;

use crate::provider::FileHandle;

/// Every way an allocation-aware operation can fail.
///
/// The protocol layer maps these onto its own wire codes through `i32::from`.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The admission check failed. No provider I/O was performed.
    #[error("allocation {} has {available} bytes available, {needed} needed", root.display())]
    OutOfSpace {
        /// The quota root that refused the charge.
        root: PathBuf,
        /// Bytes the operation would have charged.
        needed: i64,
        /// Bytes the root had available at the time of the check.
        available: i64,
    },

    /// The path lies outside every allocation.
    #[error("no allocation governs {}", .0.display())]
    NotAnAllocation(PathBuf),

    /// The operation only makes sense with allocations enabled.
    #[error("allocations are disabled")]
    Disabled,

    /// Hard links are refused while allocations are enforced.
    #[error("operation not permitted under allocation")]
    PermissionDenied,

    /// Exclusive access to an allocation's persisted state could not be obtained.
    ///
    /// The process cannot continue to account safely once this happens.
    #[error("could not lock allocation {}: {source}", root.display())]
    LockFailed {
        /// The quota root whose marker could not be locked.
        root: PathBuf,
        /// The underlying lock failure.
        #[source]
        source: std::io::Error,
    },

    /// The persisted marker does not hold two integers.
    #[error("allocation state in {} is corrupt", root.display())]
    CorruptMarker {
        /// The quota root whose marker failed to parse.
        root: PathBuf,
    },

    /// A handle-based operation referenced a handle this layer never saw opened.
    #[error("unknown file handle {0}")]
    BadHandle(FileHandle),

    /// A tree walk would have built a path longer than the supported maximum.
    #[error("path too long: {}", .0.display())]
    PathTooLong(PathBuf),

    /// A tree walk descended deeper than the configured bound.
    #[error("directory nesting too deep at {}", .0.display())]
    TooDeep(PathBuf),

    /// The provider cannot lock files, so allocations cannot be enforced.
    #[error("storage provider does not support file locking")]
    Unsupported,

    /// Passed through verbatim from the storage provider.
    #[error("provider error: {0}")]
    Provider(#[from] std::io::Error),
}

impl AllocError {
    /// Whether the process should stop accounting after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LockFailed { .. })
    }

    /// Whether this is the provider reporting `errno`.
    #[must_use]
    pub fn is_os_error(&self, errno: i32) -> bool {
        matches!(self, Self::Provider(e) if io_to_errno(e) == errno)
    }
}

/// Convert an I/O error to the corresponding errno value.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
pub(crate) fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        std::io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        std::io::ErrorKind::UnexpectedEof => libc::EPIPE,
        _ => libc::EIO,
    })
}

impl From<AllocError> for i32 {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfSpace { .. } => libc::ENOSPC,
            AllocError::NotAnAllocation(_) | AllocError::Disabled | AllocError::Unsupported => {
                libc::ENOSYS
            }
            AllocError::PermissionDenied => libc::EPERM,
            AllocError::LockFailed { ref source, .. } => io_to_errno(source),
            AllocError::CorruptMarker { .. } => libc::EIO,
            AllocError::BadHandle(_) => libc::EBADF,
            AllocError::PathTooLong(_) => libc::ENAMETOOLONG,
            AllocError::TooDeep(_) => libc::ELOOP,
            AllocError::Provider(ref io_err) => io_to_errno(io_err),
        }
    }
}

impl From<AllocError> for std::io::Error {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::Provider(io_err) => io_err,
            other => {
                let msg = other.to_string();
                let errno = i32::from(other);
                Self::new(Self::from_raw_os_error(errno).kind(), msg)
            }
        }
    }
}
