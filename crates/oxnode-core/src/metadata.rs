//! Metadata synthesis for special files.
//!
//! Special entries have no stored content, so their stat data is computed
//! from the registry entry on every request instead of being cached.

use crate::config::PassthroughConfig;
use crate::error::{PassthroughError, PassthroughResult};
use crate::kind::{S_IFMT, SpecialFileKind};
use crate::registry::RegistryEntry;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::time::SystemTime;

/// Preferred I/O block size reported for special entries.
pub const SPECIAL_BLKSIZE: u32 = 4096;

/// Stat-equivalent record for a special file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticMetadata {
    /// Registry id of the entry. The mount bridge maps it to its own inode.
    pub ino: u64,
    /// Type bits plus permission bits.
    pub mode: u32,
    pub kind: SpecialFileKind,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl SyntheticMetadata {
    /// Permission bits without the type.
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    /// Type bits alone.
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }
}

/// Produces metadata for registry entries.
#[derive(Debug, Clone, Copy)]
pub struct MetadataSynthesizer {
    uid: u32,
    gid: u32,
}

impl MetadataSynthesizer {
    pub fn new(config: &PassthroughConfig) -> Self {
        Self {
            uid: config.effective_uid(),
            gid: config.effective_gid(),
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Builds the stat record for `entry`.
    pub fn synthesize(&self, entry: &RegistryEntry) -> SyntheticMetadata {
        let size = match (&entry.kind, &entry.target) {
            (SpecialFileKind::Symlink, Some(target)) => target.as_os_str().len() as u64,
            _ => 0,
        };
        SyntheticMetadata {
            ino: entry.id,
            mode: entry.kind.type_bits() | u32::from(entry.perm),
            kind: entry.kind,
            size,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: entry.rdev,
            blksize: SPECIAL_BLKSIZE,
            blocks: 0,
            atime: entry.accessed,
            mtime: entry.modified,
            ctime: entry.changed,
            crtime: entry.created,
        }
    }

    /// `lstat`s the kernel object behind `entry`.
    ///
    /// Fails with `NotTransferable` for symlinks, which have no kernel object.
    pub fn probe(&self, entry: &RegistryEntry) -> PassthroughResult<fs::Metadata> {
        let shadow = entry
            .shadow_path()
            .ok_or_else(|| PassthroughError::NotTransferable(entry.path.clone()))?;
        fs::symlink_metadata(shadow).map_err(|e| PassthroughError::kernel(&entry.path, e))
    }

    /// Whether the synthesized type matches the live kernel object.
    pub fn agrees_with_kernel(&self, entry: &RegistryEntry) -> PassthroughResult<bool> {
        let live = self.probe(entry)?;
        Ok(live.mode() & S_IFMT == self.synthesize(entry).file_type())
    }
}
