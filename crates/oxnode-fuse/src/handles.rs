//! Open-file and open-directory handles.
//!
//! Handles are keyed by auto-incrementing ids starting at 1; 0 is never
//! handed out.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use fuser::FileType;
use oxnode_core::VirtualPath;
use std::sync::atomic::{AtomicU64, Ordering};

/// A directory entry captured at `opendir` time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListingEntry {
    pub inode: u64,
    pub kind: FileType,
    pub name: String,
}

/// Handle state for an open file or directory.
#[derive(Debug)]
pub enum FuseHandle {
    /// An open regular file, bound to its content engine entry id. It keeps
    /// working after the path is unlinked or reused.
    File { id: u64, flags: i32 },
    /// An open special file. I/O goes to the kernel object at `path`.
    Special { path: VirtualPath, flags: i32 },
    /// An open directory with a snapshot of its entries, so offsets stay
    /// stable across `readdir` calls.
    Directory { entries: Vec<DirListingEntry> },
}

impl FuseHandle {
    pub fn is_directory(&self) -> bool {
        matches!(self, FuseHandle::Directory { .. })
    }

    /// Entry id of an open regular file.
    pub fn entry_id(&self) -> Option<u64> {
        match self {
            FuseHandle::File { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn special_path(&self) -> Option<&VirtualPath> {
        match self {
            FuseHandle::Special { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn dir_entries(&self) -> Option<&[DirListingEntry]> {
        match self {
            FuseHandle::Directory { entries } => Some(entries),
            _ => None,
        }
    }

    fn access_mode(&self) -> Option<i32> {
        match self {
            FuseHandle::File { flags, .. } | FuseHandle::Special { flags, .. } => {
                Some(flags & libc::O_ACCMODE)
            }
            FuseHandle::Directory { .. } => None,
        }
    }

    /// Whether the handle was opened for reading.
    pub fn readable(&self) -> bool {
        matches!(self.access_mode(), Some(libc::O_RDONLY | libc::O_RDWR))
    }

    /// Whether the handle was opened for writing.
    pub fn writable(&self) -> bool {
        matches!(self.access_mode(), Some(libc::O_WRONLY | libc::O_RDWR))
    }
}

/// Thread-safe handle table with auto-generated ids.
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts `value` under a fresh id and returns the id.
    pub fn insert_auto(&self, value: V) -> u64 {
        let mut value = Some(value);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.handles.entry(id)
                && let Some(value) = value.take()
            {
                slot.insert(value);
                return id;
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<Ref<'_, u64, V>> {
        self.handles.get(&id)
    }

    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle table used by the filesystem.
pub type FuseHandleTable = HandleTable<FuseHandle>;
