//! Conversion from resolver metadata to FUSE attributes.
//!
//! Nothing is cached here; every reply is built from the router's current
//! answer.

use fuser::{FileAttr, FileType};
use oxnode_core::{
    ChildKind, RegularEntry, RegularKind, Resolved, SpecialFileKind, SyntheticMetadata,
};

/// Block size reported for regular entries.
pub const BLOCK_SIZE: u32 = 4096;

pub fn special_file_type(kind: SpecialFileKind) -> FileType {
    match kind {
        SpecialFileKind::Socket => FileType::Socket,
        SpecialFileKind::Fifo => FileType::NamedPipe,
        SpecialFileKind::CharDevice => FileType::CharDevice,
        SpecialFileKind::BlockDevice => FileType::BlockDevice,
        SpecialFileKind::Symlink => FileType::Symlink,
    }
}

pub fn regular_file_type(kind: RegularKind) -> FileType {
    match kind {
        RegularKind::File => FileType::RegularFile,
        RegularKind::Directory => FileType::Directory,
    }
}

pub fn child_file_type(kind: ChildKind) -> FileType {
    match kind {
        ChildKind::Regular(kind) => regular_file_type(kind),
        ChildKind::Special(kind) => special_file_type(kind),
    }
}

/// Builds the attributes of a special file under inode `ino`.
pub fn special_attr(ino: u64, meta: &SyntheticMetadata) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size,
        blocks: meta.blocks,
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
        crtime: meta.crtime,
        kind: special_file_type(meta.kind),
        perm: meta.perm(),
        nlink: meta.nlink,
        uid: meta.uid,
        gid: meta.gid,
        // The kernel ABI carries a 32-bit device number.
        rdev: meta.rdev as u32,
        blksize: meta.blksize,
        flags: 0,
    }
}

/// Builds the attributes of a regular entry under inode `ino`.
pub fn regular_attr(ino: u64, entry: &RegularEntry, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino,
        size: entry.size,
        blocks: entry.size.div_ceil(512),
        atime: entry.accessed,
        mtime: entry.modified,
        ctime: entry.changed,
        crtime: entry.created,
        kind: regular_file_type(entry.kind),
        perm: entry.perm,
        nlink: if entry.is_dir() { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

pub fn resolved_attr(ino: u64, resolved: &Resolved, uid: u32, gid: u32) -> FileAttr {
    match resolved {
        Resolved::Special(meta) => special_attr(ino, meta),
        Resolved::Regular(entry) => regular_attr(ino, entry, uid, gid),
    }
}
