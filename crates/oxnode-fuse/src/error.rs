//! Error handling and mapping for the FUSE bridge.
//!
//! Resolver errors pass through unchanged; the bridge only adds failures of
//! its own bookkeeping (unknown inodes, stale handles, undecodable names).

use oxnode_core::{PassthroughError, io_error_to_errno};
use std::io;
use thiserror::Error;

/// Errors that can occur while servicing a FUSE request.
#[derive(Debug, Error)]
pub enum FuseError {
    /// Error reported by the passthrough router.
    #[error(transparent)]
    Passthrough(#[from] PassthroughError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The kernel referenced an inode we do not know.
    #[error("Invalid inode: {0}")]
    InvalidInode(u64),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Wrong handle type (e.g. readdir on a file handle).
    #[error("Wrong handle type for operation")]
    WrongHandleType,

    /// Read on a write-only handle, or write on a read-only one.
    #[error("File handle {0} not open for this access")]
    WrongAccessMode(u64),

    /// A name that is not valid UTF-8 or contains a separator.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Negative offset from the kernel.
    #[error("Invalid offset: {0}")]
    InvalidOffset(i64),
}

impl FuseError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Passthrough(e) => e.to_errno(),
            FuseError::Io(e) => io_error_to_errno(e),
            FuseError::InvalidInode(_) => libc::ENOENT,
            FuseError::InvalidHandle(_)
            | FuseError::WrongHandleType
            | FuseError::WrongAccessMode(_) => libc::EBADF,
            FuseError::InvalidName(_) | FuseError::InvalidOffset(_) => libc::EINVAL,
        }
    }
}

impl From<oxnode_core::ContentError> for FuseError {
    fn from(e: oxnode_core::ContentError) -> Self {
        FuseError::Passthrough(e.into())
    }
}

/// Result type for FUSE operations.
pub type FuseResult<T> = Result<T, FuseError>;

#[cfg(test)]
mod tests {
    use super::*;
    use oxnode_core::{ContentError, VirtualPath};

    #[test]
    fn test_bridge_errors() {
        assert_eq!(FuseError::InvalidInode(42).to_errno(), libc::ENOENT);
        assert_eq!(FuseError::InvalidHandle(7).to_errno(), libc::EBADF);
        assert_eq!(FuseError::WrongHandleType.to_errno(), libc::EBADF);
        assert_eq!(FuseError::WrongAccessMode(3).to_errno(), libc::EBADF);
        assert_eq!(
            FuseError::InvalidName("a/b".to_string()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(FuseError::InvalidOffset(-1).to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_passthrough_errors_unchanged() {
        let path = VirtualPath::new("example.sock");
        let e: FuseError = PassthroughError::AlreadyExists(path.clone()).into();
        assert_eq!(e.to_errno(), libc::EEXIST);

        let e: FuseError = ContentError::NotEmpty(path).into();
        assert_eq!(e.to_errno(), libc::ENOTEMPTY);

        let e: FuseError = io::Error::from_raw_os_error(libc::EACCES).into();
        assert_eq!(e.to_errno(), libc::EACCES);
    }
}
