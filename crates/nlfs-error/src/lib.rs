#![forbid(unsafe_code)]
//! Error types for nlfs.
//!
//! Defines `NlfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for a POSIX-style façade layer.

use thiserror::Error;

/// Unified error type for all nlfs operations.
///
/// The core never raises asynchronously: every operation returns either a
/// result or exactly one of these kinds. Internal retries (write verify,
/// erase verify) are invisible to callers.
#[derive(Debug, Error)]
pub enum NlfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NAND operation failed on block {block}: {detail}")]
    Nand { block: u32, detail: &'static str },

    #[error("stale or invalid handle")]
    BadHandle,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("object exists")]
    Exists,

    #[error("name too long")]
    NameTooLong,

    #[error("too many levels of symbolic links")]
    LinkLoop,

    #[error("no space left on device")]
    NoSpace,

    #[error("out of memory")]
    NoMemory,

    #[error("read-only volume")]
    ReadOnly,

    #[error("cross-device link")]
    CrossDevice,

    #[error("device busy")]
    Busy,

    #[error("offset or length out of range")]
    Range,

    #[error("no such attribute")]
    NoData,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Fatal(&'static str),
}

impl NlfsError {
    /// Convert this error into a POSIX errno for a call façade.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Nand { .. } => libc::EIO,
            Self::BadHandle => libc::EBADF,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Exists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::LinkLoop => libc::ELOOP,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMemory => libc::ENOMEM,
            Self::ReadOnly => libc::EROFS,
            Self::CrossDevice => libc::EXDEV,
            Self::Busy => libc::EBUSY,
            Self::Range => libc::EINVAL,
            Self::NoData => libc::ENODATA,
            Self::Cancelled => libc::ECANCELED,
            Self::Fatal(_) => libc::EIO,
        }
    }
}

/// Result alias using `NlfsError`.
pub type Result<T> = std::result::Result<T, NlfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_posix_codes() {
        assert_eq!(NlfsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(NlfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(NlfsError::LinkLoop.to_errno(), libc::ELOOP);
        assert_eq!(NlfsError::NoData.to_errno(), libc::ENODATA);
        assert_eq!(NlfsError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(
            NlfsError::Nand {
                block: 3,
                detail: "write failed"
            }
            .to_errno(),
            libc::EIO
        );
    }
}
