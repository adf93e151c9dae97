//! Special-file classification.
//!
//! Decides from the file-type bits of a creation request whether the new
//! entry is a special file the resolver must back with a host kernel object,
//! or a regular entry that belongs to the content engine. Pure logic, no I/O.

use crate::error::{PassthroughError, PassthroughResult};
use std::fmt;

// mode_t is u16 on macOS and u32 on Linux.
#[allow(clippy::unnecessary_cast)]
pub(crate) mod bits {
    pub const S_IFMT: u32 = libc::S_IFMT as u32;
    pub const S_IFSOCK: u32 = libc::S_IFSOCK as u32;
    pub const S_IFLNK: u32 = libc::S_IFLNK as u32;
    pub const S_IFREG: u32 = libc::S_IFREG as u32;
    pub const S_IFBLK: u32 = libc::S_IFBLK as u32;
    pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
    pub const S_IFCHR: u32 = libc::S_IFCHR as u32;
    pub const S_IFIFO: u32 = libc::S_IFIFO as u32;
    pub const PERM_MASK: u32 = 0o7777;
}

pub use bits::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};

/// The kind of a special file.
///
/// Regular files and directories have no variant; the classifier reports
/// them as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialFileKind {
    /// UNIX domain socket.
    Socket,
    /// Named pipe.
    Fifo,
    /// Character device node.
    CharDevice,
    /// Block device node.
    BlockDevice,
    /// Symbolic link. Has no backing kernel object.
    Symlink,
}

impl SpecialFileKind {
    /// The `S_IFMT` type bits for this kind.
    pub const fn type_bits(self) -> u32 {
        match self {
            SpecialFileKind::Socket => S_IFSOCK,
            SpecialFileKind::Fifo => S_IFIFO,
            SpecialFileKind::CharDevice => S_IFCHR,
            SpecialFileKind::BlockDevice => S_IFBLK,
            SpecialFileKind::Symlink => S_IFLNK,
        }
    }

    /// Recovers the kind from a full mode value (e.g. an `lstat` result).
    ///
    /// Returns `None` for regular files, directories and unknown types.
    pub const fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFSOCK => Some(SpecialFileKind::Socket),
            S_IFIFO => Some(SpecialFileKind::Fifo),
            S_IFCHR => Some(SpecialFileKind::CharDevice),
            S_IFBLK => Some(SpecialFileKind::BlockDevice),
            S_IFLNK => Some(SpecialFileKind::Symlink),
            _ => None,
        }
    }

    /// Whether entries of this kind are backed by a live kernel object.
    pub const fn has_kernel_object(self) -> bool {
        !matches!(self, SpecialFileKind::Symlink)
    }

    /// Whether this kind carries a device number.
    pub const fn is_device(self) -> bool {
        matches!(self, SpecialFileKind::CharDevice | SpecialFileKind::BlockDevice)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SpecialFileKind::Socket => "socket",
            SpecialFileKind::Fifo => "fifo",
            SpecialFileKind::CharDevice => "char-device",
            SpecialFileKind::BlockDevice => "block-device",
            SpecialFileKind::Symlink => "symlink",
        }
    }
}

impl fmt::Display for SpecialFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A creation request as it arrives from the mount bridge (`mknod`, `mkdir`,
/// `create`, `bind`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateRequest {
    /// Type bits plus permission bits.
    pub mode: u32,
    /// Permission bits to clear from `mode`.
    pub umask: u32,
    /// Device number, only meaningful for device nodes.
    pub rdev: u64,
}

impl CreateRequest {
    pub fn new(mode: u32) -> Self {
        Self {
            mode,
            umask: 0,
            rdev: 0,
        }
    }

    pub fn socket(perm: u32) -> Self {
        Self::new(S_IFSOCK | (perm & bits::PERM_MASK))
    }

    pub fn fifo(perm: u32) -> Self {
        Self::new(S_IFIFO | (perm & bits::PERM_MASK))
    }

    pub fn char_device(perm: u32, rdev: u64) -> Self {
        Self::new(S_IFCHR | (perm & bits::PERM_MASK)).with_rdev(rdev)
    }

    pub fn block_device(perm: u32, rdev: u64) -> Self {
        Self::new(S_IFBLK | (perm & bits::PERM_MASK)).with_rdev(rdev)
    }

    pub fn regular_file(perm: u32) -> Self {
        Self::new(S_IFREG | (perm & bits::PERM_MASK))
    }

    pub fn directory(perm: u32) -> Self {
        Self::new(S_IFDIR | (perm & bits::PERM_MASK))
    }

    #[must_use]
    pub fn with_umask(mut self, umask: u32) -> Self {
        self.umask = umask;
        self
    }

    #[must_use]
    pub fn with_rdev(mut self, rdev: u64) -> Self {
        self.rdev = rdev;
        self
    }

    /// The type bits of the request.
    #[inline]
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    /// Effective permission bits after applying the umask.
    #[inline]
    pub fn permissions(&self) -> u16 {
        (self.mode & !self.umask & bits::PERM_MASK) as u16
    }

    /// Whether the request asks for a directory.
    #[inline]
    pub fn is_directory(&self) -> bool {
        self.file_type() == S_IFDIR
    }
}

/// Classifies a creation request.
///
/// Returns `Ok(None)` for regular files and directories (a type of `0` is
/// treated as a regular file, as `mknod(2)` does).
pub fn classify(request: &CreateRequest) -> PassthroughResult<Option<SpecialFileKind>> {
    match request.file_type() {
        0 | S_IFREG | S_IFDIR => Ok(None),
        _ => SpecialFileKind::from_mode(request.mode)
            .map(Some)
            .ok_or(PassthroughError::UnsupportedType(request.mode)),
    }
}
