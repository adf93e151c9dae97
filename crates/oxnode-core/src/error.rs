//! Error taxonomy for the passthrough resolver.
//!
//! Every error carries enough context to be logged on its own and maps to a
//! POSIX errno through [`PassthroughError::to_errno`], which is what the
//! mount bridge hands back to the kernel.

use crate::path::VirtualPath;
use std::io;
use thiserror::Error;

/// Errors produced by the content-storage engine.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("No such entry: {0}")]
    NotFound(VirtualPath),

    #[error("Entry already exists: {0}")]
    AlreadyExists(VirtualPath),

    #[error("Not a directory: {0}")]
    NotADirectory(VirtualPath),

    #[error("Is a directory: {0}")]
    IsADirectory(VirtualPath),

    #[error("Directory not empty: {0}")]
    NotEmpty(VirtualPath),

    /// The operation makes no sense for this path (e.g. removing the root).
    #[error("Invalid operation on {0}")]
    InvalidOperation(VirtualPath),

    /// The write or truncate would grow the file past the engine's limit.
    #[error("File too large: {0}")]
    FileTooLarge(VirtualPath),

    /// No open entry has this id.
    #[error("Unknown entry id {0}")]
    UnknownEntry(u64),
}

impl ContentError {
    pub fn to_errno(&self) -> i32 {
        match self {
            ContentError::NotFound(_) => libc::ENOENT,
            ContentError::AlreadyExists(_) => libc::EEXIST,
            ContentError::NotADirectory(_) => libc::ENOTDIR,
            ContentError::IsADirectory(_) => libc::EISDIR,
            ContentError::NotEmpty(_) => libc::ENOTEMPTY,
            ContentError::InvalidOperation(_) => libc::EINVAL,
            ContentError::FileTooLarge(_) => libc::EFBIG,
            ContentError::UnknownEntry(_) => libc::EBADF,
        }
    }
}

/// Errors surfaced by the classifier, registry and router.
#[derive(Debug, Error)]
pub enum PassthroughError {
    /// The requested mode does not map to any known file type.
    #[error("Unsupported file type in mode {0:#o}")]
    UnsupportedType(u32),

    /// An entry already exists at the path.
    #[error("Entry already exists: {0}")]
    AlreadyExists(VirtualPath),

    /// The host could not allocate or release the backing kernel object.
    #[error("Kernel object allocation failed for {path}: {source}")]
    KernelResource {
        path: VirtualPath,
        #[source]
        source: io::Error,
    },

    #[error("No such entry: {0}")]
    NotFound(VirtualPath),

    /// The path is tracked by both the registry and the content engine.
    #[error("Path tracked by both the registry and the content engine: {0}")]
    InconsistentState(VirtualPath),

    /// The entry has no kernel object to hand out (regular file, directory
    /// or symlink).
    #[error("Entry has no kernel object: {0}")]
    NotTransferable(VirtualPath),

    #[error("Content engine error: {0}")]
    Content(#[from] ContentError),
}

impl PassthroughError {
    /// Converts this error to a libc error code.
    pub fn to_errno(&self) -> i32 {
        match self {
            PassthroughError::UnsupportedType(_) | PassthroughError::NotTransferable(_) => {
                libc::EINVAL
            }
            PassthroughError::AlreadyExists(_) => libc::EEXIST,
            PassthroughError::KernelResource { source, .. } => io_error_to_errno(source),
            PassthroughError::NotFound(_) => libc::ENOENT,
            PassthroughError::InconsistentState(_) => libc::EIO,
            PassthroughError::Content(e) => e.to_errno(),
        }
    }

    /// Whether a caller may reasonably retry the request.
    ///
    /// Only host allocation failures qualify; the resolver itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PassthroughError::KernelResource { .. })
    }

    pub(crate) fn kernel(path: &VirtualPath, source: io::Error) -> Self {
        PassthroughError::KernelResource {
            path: path.clone(),
            source,
        }
    }
}

/// Result type for passthrough operations.
pub type PassthroughResult<T> = Result<T, PassthroughError>;

/// Maps an I/O error to an errno, falling back to `EIO`.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let p = VirtualPath::new("example.sock");
        assert_eq!(PassthroughError::UnsupportedType(0o170000).to_errno(), libc::EINVAL);
        assert_eq!(PassthroughError::AlreadyExists(p.clone()).to_errno(), libc::EEXIST);
        assert_eq!(PassthroughError::NotFound(p.clone()).to_errno(), libc::ENOENT);
        assert_eq!(PassthroughError::InconsistentState(p.clone()).to_errno(), libc::EIO);
        assert_eq!(PassthroughError::NotTransferable(p).to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_kernel_resource_keeps_os_errno() {
        let p = VirtualPath::new("dev/null0");
        let e = PassthroughError::kernel(&p, io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(e.to_errno(), libc::EMFILE);
        assert!(e.is_retryable());

        let e = PassthroughError::kernel(&p, io::Error::other("no errno"));
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn test_content_errors_pass_through() {
        let p = VirtualPath::new("dir");
        let cases = [
            (ContentError::NotFound(p.clone()), libc::ENOENT),
            (ContentError::AlreadyExists(p.clone()), libc::EEXIST),
            (ContentError::NotADirectory(p.clone()), libc::ENOTDIR),
            (ContentError::IsADirectory(p.clone()), libc::EISDIR),
            (ContentError::NotEmpty(p.clone()), libc::ENOTEMPTY),
            (ContentError::InvalidOperation(p.clone()), libc::EINVAL),
            (ContentError::FileTooLarge(p), libc::EFBIG),
            (ContentError::UnknownEntry(7), libc::EBADF),
        ];
        for (content, errno) in cases {
            let e: PassthroughError = content.into();
            assert_eq!(e.to_errno(), errno);
            assert!(!e.is_retryable());
        }
    }

    #[test]
    fn test_display_includes_path() {
        let e = PassthroughError::NotFound(VirtualPath::new("run/app.sock"));
        assert!(e.to_string().contains("/run/app.sock"));
    }
}
