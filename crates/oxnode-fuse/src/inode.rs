//! Inode management for the FUSE bridge.
//!
//! Maps kernel inode numbers to virtual paths and tracks the kernel's lookup
//! count for each, so entries are only evicted when `forget` says so.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use oxnode_core::VirtualPath;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// The virtual path within the mount.
    pub path: VirtualPath,
    /// Lookup count for `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: VirtualPath, nlookup: u64) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count and returns the new value.
    ///
    /// Returns `None` (leaving the count untouched) if it would go negative.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        self.nlookup
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(count))
            .ok()
            .map(|old| old - count)
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe table mapping between inodes and virtual paths.
#[derive(Debug)]
pub struct InodeTable {
    inodes: DashMap<u64, InodeEntry>,
    paths: DashMap<VirtualPath, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Creates a new inode table with the root directory pre-allocated.
    pub fn new() -> Self {
        let root = VirtualPath::root();
        let inodes = DashMap::new();
        inodes.insert(ROOT_INODE, InodeEntry::new(root.clone(), 1));
        let paths = DashMap::new();
        paths.insert(root, ROOT_INODE);
        Self {
            inodes,
            paths,
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    /// Returns the inode for `path`, allocating one if needed, and counts a
    /// kernel lookup against it.
    pub fn get_or_insert(&self, path: &VirtualPath) -> u64 {
        self.get_or_insert_counting(path, 1)
    }

    /// Like [`get_or_insert`](Self::get_or_insert) but without touching the
    /// lookup count, for `readdir` entries.
    pub fn get_or_insert_no_lookup_inc(&self, path: &VirtualPath) -> u64 {
        self.get_or_insert_counting(path, 0)
    }

    fn get_or_insert_counting(&self, path: &VirtualPath, lookups: u64) -> u64 {
        match self.paths.entry(path.clone()) {
            Entry::Occupied(mut slot) => {
                let inode = *slot.get();
                if let Some(entry) = self.inodes.get(&inode) {
                    if lookups > 0 {
                        entry.inc_nlookup();
                    }
                    return inode;
                }
                // Evicted by a concurrent forget; rebind the path.
                let inode = self.allocate(path, lookups);
                slot.insert(inode);
                inode
            }
            Entry::Vacant(slot) => {
                let inode = self.allocate(path, lookups);
                slot.insert(inode);
                inode
            }
        }
    }

    fn allocate(&self, path: &VirtualPath, lookups: u64) -> u64 {
        let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
        self.inodes
            .insert(inode, InodeEntry::new(path.clone(), lookups));
        inode
    }

    pub fn get(&self, inode: u64) -> Option<Ref<'_, u64, InodeEntry>> {
        self.inodes.get(&inode)
    }

    /// The path currently bound to `inode`.
    pub fn path_of(&self, inode: u64) -> Option<VirtualPath> {
        self.inodes.get(&inode).map(|e| e.path.clone())
    }

    /// Looks up an inode by path.
    pub fn get_inode(&self, path: &VirtualPath) -> Option<u64> {
        self.paths.get(path).map(|i| *i)
    }

    /// Decrements the lookup count for an inode, evicting it at zero.
    ///
    /// Returns `true` if the inode was evicted. The root is never evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }
        let Some(entry) = self.inodes.get(&inode) else {
            return false;
        };
        if entry.dec_nlookup(nlookup) != Some(0) {
            return false;
        }
        drop(entry);
        let Some((_, evicted)) = self.inodes.remove_if(&inode, |_, e| e.nlookup() == 0) else {
            return false;
        };
        self.paths.remove_if(&evicted.path, |_, i| *i == inode);
        true
    }

    /// Unbinds `path` after it was deleted.
    ///
    /// The inode itself stays until the kernel forgets it, since the kernel
    /// may still hand us the number.
    pub fn invalidate_path(&self, path: &VirtualPath) {
        self.paths.remove(path);
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// Always false; the root inode is never evicted.
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_inode_exists() {
        let table = InodeTable::new();
        assert!(table.get(ROOT_INODE).unwrap().path.is_root());
        assert_eq!(table.get_inode(&VirtualPath::root()), Some(ROOT_INODE));
    }

    #[test]
    fn test_allocate_inode() {
        let table = InodeTable::new();
        let path = VirtualPath::new("example.sock");
        let inode = table.get_or_insert(&path);
        assert!(inode > ROOT_INODE);
        assert_eq!(table.get_or_insert(&path), inode);
        assert_eq!(table.get(inode).unwrap().nlookup(), 2);
        assert_eq!(table.path_of(inode), Some(path));
    }

    #[test]
    fn test_forget_evicts_at_zero() {
        let table = InodeTable::new();
        let path = VirtualPath::new("a");
        let inode = table.get_or_insert(&path);
        table.get_or_insert(&path);

        assert!(!table.forget(inode, 1));
        assert!(table.forget(inode, 1));
        assert!(table.get(inode).is_none());
        assert!(table.get_inode(&path).is_none());
    }

    #[test]
    fn test_forget_root_is_noop() {
        let table = InodeTable::new();
        assert!(!table.forget(ROOT_INODE, 100));
        assert!(table.get(ROOT_INODE).is_some());
    }

    #[test]
    fn test_readdir_entries_do_not_count() {
        let table = InodeTable::new();
        let path = VirtualPath::new("listed");
        let inode = table.get_or_insert_no_lookup_inc(&path);
        assert_eq!(table.get(inode).unwrap().nlookup(), 0);
        assert_eq!(table.get_or_insert(&path), inode);
        assert_eq!(table.get(inode).unwrap().nlookup(), 1);
    }

    #[test]
    fn test_invalidate_keeps_inode_until_forget() {
        let table = InodeTable::new();
        let path = VirtualPath::new("gone");
        let inode = table.get_or_insert(&path);
        table.invalidate_path(&path);
        assert!(table.get_inode(&path).is_none());
        assert!(table.get(inode).is_some());

        // A new entry at the same path gets a fresh inode.
        let reborn = table.get_or_insert(&path);
        assert_ne!(reborn, inode);
        assert!(table.forget(inode, 1));
        assert_eq!(table.get_inode(&path), Some(reborn));
    }
}
