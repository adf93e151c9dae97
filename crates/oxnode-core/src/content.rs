//! The content-storage engine seam.
//!
//! Regular files and directories belong to a [`ContentEngine`]. The router
//! forwards every regular-path request to it unchanged and never hands it a
//! special file. [`MemoryContentStore`] is an in-memory engine used by the
//! mount binary and by tests.
//!
//! Open files are addressed by entry id rather than by path: an entry opened
//! with [`ContentEngine::open_entry`] keeps its contents after it is unlinked,
//! until the last [`ContentEngine::release_entry`].

use crate::error::ContentError;
use crate::path::VirtualPath;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// The kind of a regular entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegularKind {
    File,
    Directory,
}

/// Metadata for a regular entry, as reported by the content engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularEntry {
    pub path: VirtualPath,
    pub kind: RegularKind,
    /// Engine-unique id, stable for the lifetime of the entry.
    pub id: u64,
    pub perm: u16,
    pub size: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub changed: SystemTime,
    pub accessed: SystemTime,
}

impl RegularEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == RegularKind::Directory
    }
}

/// Attribute changes requested through `setattr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrChanges {
    pub perm: Option<u16>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl AttrChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularChild {
    pub name: String,
    pub kind: RegularKind,
    pub id: u64,
}

/// Storage for regular files and directories.
pub trait ContentEngine: Send + Sync {
    /// Creates a file or directory at `path`. The parent must exist.
    fn create_regular_entry(
        &self,
        path: &VirtualPath,
        kind: RegularKind,
        perm: u16,
    ) -> Result<RegularEntry, ContentError>;

    /// Returns the entry at `path`, if any.
    fn lookup_regular_entry(&self, path: &VirtualPath) -> Option<RegularEntry>;

    /// Removes the file at `path`. Directories are refused with `IsADirectory`.
    ///
    /// An entry that is still open stays readable through its id.
    fn remove_regular_entry(&self, path: &VirtualPath) -> Result<(), ContentError>;

    /// Removes the empty directory at `path`.
    fn remove_directory(&self, path: &VirtualPath) -> Result<(), ContentError>;

    /// Lists the children of the directory at `dir`.
    fn list_children(&self, dir: &VirtualPath) -> Result<Vec<RegularChild>, ContentError>;

    fn read(&self, path: &VirtualPath, offset: u64, size: usize) -> Result<Bytes, ContentError>;

    /// Writes `data` at `offset`, extending the file as needed.
    fn write(&self, path: &VirtualPath, offset: u64, data: &[u8]) -> Result<usize, ContentError>;

    fn truncate(&self, path: &VirtualPath, size: u64) -> Result<(), ContentError>;

    fn set_attributes(
        &self,
        path: &VirtualPath,
        changes: &AttrChanges,
    ) -> Result<RegularEntry, ContentError>;

    /// Opens the file at `path` for I/O by id.
    fn open_entry(&self, path: &VirtualPath) -> Result<RegularEntry, ContentError>;

    fn read_entry(&self, id: u64, offset: u64, size: usize) -> Result<Bytes, ContentError>;

    fn write_entry(&self, id: u64, offset: u64, data: &[u8]) -> Result<usize, ContentError>;

    /// Drops one open reference taken by [`open_entry`](Self::open_entry).
    fn release_entry(&self, id: u64);
}

#[derive(Debug)]
struct Node {
    entry: RegularEntry,
    data: Vec<u8>,
    /// Outstanding `open_entry` references.
    open: u32,
    /// False once unlinked; the node lives on while `open > 0`.
    linked: bool,
}

impl Node {
    fn new(entry: RegularEntry) -> Self {
        Self {
            entry,
            data: Vec::new(),
            open: 0,
            linked: true,
        }
    }

    fn read_at(&mut self, offset: u64, size: usize) -> Bytes {
        self.entry.accessed = SystemTime::now();
        let len = self.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size).min(len);
        Bytes::copy_from_slice(&self.data[start..end])
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, ContentError> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MemoryContentStore::MAX_FILE_SIZE);
        let (Ok(start), Some(Ok(end))) = (usize::try_from(offset), end.map(usize::try_from))
        else {
            return Err(ContentError::FileTooLarge(self.entry.path.clone()));
        };
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        self.touch(self.data.len());
        Ok(data.len())
    }

    fn resize(&mut self, size: u64) -> Result<(), ContentError> {
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size as u64 <= MemoryContentStore::MAX_FILE_SIZE)
            .ok_or_else(|| ContentError::FileTooLarge(self.entry.path.clone()))?;
        self.data.resize(size, 0);
        self.touch(self.data.len());
        Ok(())
    }

    fn touch(&mut self, len: usize) {
        let now = SystemTime::now();
        self.entry.size = len as u64;
        self.entry.modified = now;
        self.entry.changed = now;
    }
}

/// Path index plus the nodes it points at. Unlinked-but-open nodes are in
/// `nodes` only.
#[derive(Debug, Default)]
struct Tree {
    paths: HashMap<VirtualPath, u64>,
    nodes: HashMap<u64, Node>,
}

impl Tree {
    fn get(&self, path: &VirtualPath) -> Option<&Node> {
        self.paths.get(path).and_then(|id| self.nodes.get(id))
    }

    fn get_mut(&mut self, path: &VirtualPath) -> Option<&mut Node> {
        let id = self.paths.get(path)?;
        self.nodes.get_mut(id)
    }

    fn file_mut(&mut self, path: &VirtualPath) -> Result<&mut Node, ContentError> {
        let node = self
            .get_mut(path)
            .ok_or_else(|| ContentError::NotFound(path.clone()))?;
        if node.entry.is_dir() {
            return Err(ContentError::IsADirectory(path.clone()));
        }
        Ok(node)
    }

    fn file_by_id(&mut self, id: u64) -> Result<&mut Node, ContentError> {
        match self.nodes.get_mut(&id) {
            Some(node) if node.entry.is_dir() => {
                Err(ContentError::IsADirectory(node.entry.path.clone()))
            }
            Some(node) => Ok(node),
            None => Err(ContentError::UnknownEntry(id)),
        }
    }
}

/// In-memory content engine.
#[derive(Debug)]
pub struct MemoryContentStore {
    tree: RwLock<Tree>,
    next_id: AtomicU64,
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContentStore {
    /// Id of the root directory.
    pub const ROOT_ID: u64 = 1;

    /// Largest file the store will hold (4 GiB).
    pub const MAX_FILE_SIZE: u64 = 1 << 32;

    /// Creates a store holding only the root directory.
    pub fn new() -> Self {
        let root = VirtualPath::root();
        let mut tree = Tree::default();
        tree.paths.insert(root.clone(), Self::ROOT_ID);
        tree.nodes.insert(
            Self::ROOT_ID,
            Node::new(new_entry(root, RegularKind::Directory, Self::ROOT_ID, 0o755)),
        );
        Self {
            tree: RwLock::new(tree),
            next_id: AtomicU64::new(Self::ROOT_ID + 1),
        }
    }

    /// Creates a store populated with `files`, creating parent directories
    /// as needed.
    pub fn with_files<I, P, C>(files: I) -> Result<Self, ContentError>
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: AsRef<[u8]>,
    {
        let store = Self::new();
        for (path, contents) in files {
            let path = VirtualPath::new(path);
            let Some(parent) = path.parent() else {
                return Err(ContentError::InvalidOperation(path));
            };
            store.make_dirs(&parent)?;
            store.create_regular_entry(&path, RegularKind::File, 0o644)?;
            store.write(&path, 0, contents.as_ref())?;
        }
        Ok(store)
    }

    fn make_dirs(&self, dir: &VirtualPath) -> Result<(), ContentError> {
        let mut current = VirtualPath::root();
        for component in dir.components() {
            current = current.join(component);
            match self.lookup_regular_entry(&current) {
                Some(entry) if entry.is_dir() => {}
                Some(_) => return Err(ContentError::NotADirectory(current)),
                None => {
                    self.create_regular_entry(&current, RegularKind::Directory, 0o755)?;
                }
            }
        }
        Ok(())
    }

    /// Number of entries reachable by path.
    pub fn len(&self) -> usize {
        self.tree.read().paths.len()
    }

    /// Always false; the root directory is never removed.
    pub fn is_empty(&self) -> bool {
        self.tree.read().paths.is_empty()
    }

    /// Number of unlinked entries kept alive by open references.
    pub fn orphan_count(&self) -> usize {
        self.tree.read().nodes.values().filter(|n| !n.linked).count()
    }
}

fn new_entry(path: VirtualPath, kind: RegularKind, id: u64, perm: u16) -> RegularEntry {
    let now = SystemTime::now();
    RegularEntry {
        path,
        kind,
        id,
        perm,
        size: 0,
        created: now,
        modified: now,
        changed: now,
        accessed: now,
    }
}

impl ContentEngine for MemoryContentStore {
    fn create_regular_entry(
        &self,
        path: &VirtualPath,
        kind: RegularKind,
        perm: u16,
    ) -> Result<RegularEntry, ContentError> {
        let Some(parent) = path.parent() else {
            return Err(ContentError::AlreadyExists(path.clone()));
        };
        let mut tree = self.tree.write();
        match tree.get(&parent) {
            None => return Err(ContentError::NotFound(parent)),
            Some(node) if !node.entry.is_dir() => return Err(ContentError::NotADirectory(parent)),
            Some(_) => {}
        }
        if tree.paths.contains_key(path) {
            return Err(ContentError::AlreadyExists(path.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = new_entry(path.clone(), kind, id, perm);
        tree.paths.insert(path.clone(), id);
        tree.nodes.insert(id, Node::new(entry.clone()));
        if let Some(parent) = tree.get_mut(&parent) {
            let now = SystemTime::now();
            parent.entry.modified = now;
            parent.entry.changed = now;
        }
        Ok(entry)
    }

    fn lookup_regular_entry(&self, path: &VirtualPath) -> Option<RegularEntry> {
        self.tree.read().get(path).map(|n| n.entry.clone())
    }

    fn remove_regular_entry(&self, path: &VirtualPath) -> Result<(), ContentError> {
        let mut tree = self.tree.write();
        let node = tree.file_mut(path)?;
        let id = node.entry.id;
        node.linked = false;
        let open = node.open;
        tree.paths.remove(path);
        if open == 0 {
            tree.nodes.remove(&id);
        }
        Ok(())
    }

    fn remove_directory(&self, path: &VirtualPath) -> Result<(), ContentError> {
        if path.is_root() {
            return Err(ContentError::InvalidOperation(path.clone()));
        }
        let mut tree = self.tree.write();
        let id = match tree.get(path) {
            None => return Err(ContentError::NotFound(path.clone())),
            Some(node) if !node.entry.is_dir() => {
                return Err(ContentError::NotADirectory(path.clone()));
            }
            Some(node) => node.entry.id,
        };
        if tree.paths.keys().any(|k| path.is_parent_of(k)) {
            return Err(ContentError::NotEmpty(path.clone()));
        }
        tree.paths.remove(path);
        tree.nodes.remove(&id);
        Ok(())
    }

    fn list_children(&self, dir: &VirtualPath) -> Result<Vec<RegularChild>, ContentError> {
        let tree = self.tree.read();
        match tree.get(dir) {
            None => return Err(ContentError::NotFound(dir.clone())),
            Some(node) if !node.entry.is_dir() => {
                return Err(ContentError::NotADirectory(dir.clone()));
            }
            Some(_) => {}
        }
        let mut children: Vec<RegularChild> = tree
            .paths
            .iter()
            .filter(|(k, _)| dir.is_parent_of(k))
            .filter_map(|(k, id)| {
                let node = tree.nodes.get(id)?;
                k.file_name().map(|name| RegularChild {
                    name: name.to_string(),
                    kind: node.entry.kind,
                    id: *id,
                })
            })
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn read(&self, path: &VirtualPath, offset: u64, size: usize) -> Result<Bytes, ContentError> {
        Ok(self.tree.write().file_mut(path)?.read_at(offset, size))
    }

    fn write(&self, path: &VirtualPath, offset: u64, data: &[u8]) -> Result<usize, ContentError> {
        self.tree.write().file_mut(path)?.write_at(offset, data)
    }

    fn truncate(&self, path: &VirtualPath, size: u64) -> Result<(), ContentError> {
        self.tree.write().file_mut(path)?.resize(size)
    }

    fn set_attributes(
        &self,
        path: &VirtualPath,
        changes: &AttrChanges,
    ) -> Result<RegularEntry, ContentError> {
        let mut tree = self.tree.write();
        if let Some(size) = changes.size {
            tree.file_mut(path)?.resize(size)?;
        }
        let node = tree
            .get_mut(path)
            .ok_or_else(|| ContentError::NotFound(path.clone()))?;
        if let Some(perm) = changes.perm {
            node.entry.perm = perm;
        }
        if let Some(atime) = changes.atime {
            node.entry.accessed = atime;
        }
        if let Some(mtime) = changes.mtime {
            node.entry.modified = mtime;
        }
        node.entry.changed = SystemTime::now();
        Ok(node.entry.clone())
    }

    fn open_entry(&self, path: &VirtualPath) -> Result<RegularEntry, ContentError> {
        let mut tree = self.tree.write();
        let node = tree.file_mut(path)?;
        node.open += 1;
        Ok(node.entry.clone())
    }

    fn read_entry(&self, id: u64, offset: u64, size: usize) -> Result<Bytes, ContentError> {
        Ok(self.tree.write().file_by_id(id)?.read_at(offset, size))
    }

    fn write_entry(&self, id: u64, offset: u64, data: &[u8]) -> Result<usize, ContentError> {
        self.tree.write().file_by_id(id)?.write_at(offset, data)
    }

    fn release_entry(&self, id: u64) {
        let mut tree = self.tree.write();
        let Some(node) = tree.nodes.get_mut(&id) else {
            return;
        };
        node.open = node.open.saturating_sub(1);
        if node.open == 0 && !node.linked {
            tree.nodes.remove(&id);
        }
    }
}
