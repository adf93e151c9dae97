//! The passthrough operation router.
//!
//! Every filesystem-level request enters through [`PassthroughRouter`].
//! Special paths are answered by the kernel object registry and the metadata
//! synthesizer; regular paths are forwarded to the content engine unchanged.
//! The content engine never sees a special file.

use crate::config::PassthroughConfig;
use crate::content::{AttrChanges, ContentEngine, RegularEntry, RegularKind};
use crate::error::{ContentError, PassthroughError, PassthroughResult};
use crate::handle::KernelObjectHandle;
use crate::kind::{CreateRequest, SpecialFileKind, classify};
use crate::metadata::{MetadataSynthesizer, SyntheticMetadata};
use crate::path::VirtualPath;
use crate::registry::KernelObjectRegistry;
use crate::stats::PassthroughStats;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{self, Permissions};
use std::ops::Deref;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// What a path resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A special file; metadata synthesized from the registry.
    Special(SyntheticMetadata),
    /// A regular file or directory, as reported by the content engine.
    Regular(RegularEntry),
}

impl Resolved {
    pub fn special_kind(&self) -> Option<SpecialFileKind> {
        match self {
            Resolved::Special(meta) => Some(meta.kind),
            Resolved::Regular(_) => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Resolved::Regular(entry) if entry.is_dir())
    }
}

/// Kind of a directory child, for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Regular(RegularKind),
    Special(SpecialFileKind),
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: ChildKind,
}

/// Shared access to the kernel object behind a special path.
///
/// Holds no registry lock, so blocking I/O through it never stalls other
/// requests. If the path is removed meanwhile, the shadow path is unlinked
/// at once and the descriptor stays usable until the guard drops.
#[derive(Debug, Clone)]
pub struct TransferGuard {
    path: VirtualPath,
    handle: Arc<KernelObjectHandle>,
}

impl TransferGuard {
    pub fn path(&self) -> &VirtualPath {
        &self.path
    }
}

impl Deref for TransferGuard {
    type Target = KernelObjectHandle;

    fn deref(&self) -> &KernelObjectHandle {
        &self.handle
    }
}

/// Routes path operations to the registry or the content engine.
pub struct PassthroughRouter {
    registry: KernelObjectRegistry,
    engine: Arc<dyn ContentEngine>,
    synthesizer: MetadataSynthesizer,
    /// Serializes regular and special creation on the same path.
    creation_locks: DashMap<VirtualPath, Arc<Mutex<()>>>,
    stats: Arc<PassthroughStats>,
}

impl PassthroughRouter {
    /// Creates a router over `engine`, with a fresh registry.
    pub fn new(engine: Arc<dyn ContentEngine>, config: &PassthroughConfig) -> PassthroughResult<Self> {
        let registry = KernelObjectRegistry::new(config)
            .map_err(|e| PassthroughError::kernel(&VirtualPath::root(), e))?;
        Ok(Self {
            registry,
            engine,
            synthesizer: MetadataSynthesizer::new(config),
            creation_locks: DashMap::new(),
            stats: Arc::new(PassthroughStats::new()),
        })
    }

    pub fn registry(&self) -> &KernelObjectRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn ContentEngine> {
        &self.engine
    }

    pub fn synthesizer(&self) -> &MetadataSynthesizer {
        &self.synthesizer
    }

    pub fn stats(&self) -> &Arc<PassthroughStats> {
        &self.stats
    }

    fn creation_lock(&self, path: &VirtualPath) -> Arc<Mutex<()>> {
        Arc::clone(&self.creation_locks.entry(path.clone()).or_default())
    }

    fn drop_creation_lock(&self, path: &VirtualPath) {
        self.creation_locks
            .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn record<T>(&self, result: PassthroughResult<T>) -> PassthroughResult<T> {
        if result.is_err() {
            self.stats.record_error();
        }
        result
    }

    /// Checks that `path`'s parent is an existing directory.
    fn require_parent_dir(&self, path: &VirtualPath) -> PassthroughResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| PassthroughError::AlreadyExists(path.clone()))?;
        match self.engine.lookup_regular_entry(&parent) {
            Some(entry) if entry.is_dir() => Ok(()),
            Some(_) => Err(ContentError::NotADirectory(parent).into()),
            None if self.registry.contains(&parent) => {
                Err(ContentError::NotADirectory(parent).into())
            }
            None => Err(PassthroughError::NotFound(parent)),
        }
    }

    fn synthesize_at(&self, path: &VirtualPath) -> PassthroughResult<Resolved> {
        let entry = self
            .registry
            .lookup(path)
            .ok_or_else(|| PassthroughError::NotFound(path.clone()))?;
        Ok(Resolved::Special(self.synthesizer.synthesize(&entry)))
    }

    /// Creates an entry at `path` as described by `request`.
    ///
    /// Special kinds get a kernel object in the registry; files and
    /// directories go to the content engine.
    pub fn create(&self, path: &VirtualPath, request: &CreateRequest) -> PassthroughResult<Resolved> {
        trace!(path = %path, mode = format_args!("{:#o}", request.mode), "create");
        let result = self.create_inner(path, request);
        self.record(result)
    }

    fn create_inner(&self, path: &VirtualPath, request: &CreateRequest) -> PassthroughResult<Resolved> {
        let kind = classify(request)?;
        if kind == Some(SpecialFileKind::Symlink) {
            // Symlinks carry a target; they come through create_symlink.
            return Err(PassthroughError::UnsupportedType(request.mode));
        }
        self.require_parent_dir(path)?;

        let lock = self.creation_lock(path);
        let result = {
            let _guard = lock.lock();
            match kind {
                Some(kind) => self.create_special(path, kind, request),
                None => self.create_regular(path, request),
            }
        };
        drop(lock);
        self.drop_creation_lock(path);
        result
    }

    fn create_special(
        &self,
        path: &VirtualPath,
        kind: SpecialFileKind,
        request: &CreateRequest,
    ) -> PassthroughResult<Resolved> {
        if self.engine.lookup_regular_entry(path).is_some() {
            return Err(PassthroughError::AlreadyExists(path.clone()));
        }
        self.registry
            .create(path, kind, request.permissions(), request.rdev)?;
        self.stats.record_special_created();
        self.synthesize_at(path)
    }

    fn create_regular(&self, path: &VirtualPath, request: &CreateRequest) -> PassthroughResult<Resolved> {
        if self.registry.contains(path) {
            return Err(PassthroughError::AlreadyExists(path.clone()));
        }
        let kind = if request.is_directory() {
            RegularKind::Directory
        } else {
            RegularKind::File
        };
        self.stats.record_regular_forwarded();
        let entry = self
            .engine
            .create_regular_entry(path, kind, request.permissions())?;
        Ok(Resolved::Regular(entry))
    }

    /// Creates a directory.
    pub fn mkdir(&self, path: &VirtualPath, perm: u32, umask: u32) -> PassthroughResult<Resolved> {
        self.create(path, &CreateRequest::directory(perm).with_umask(umask))
    }

    /// Records a symlink at `path` pointing at `target`.
    pub fn create_symlink(&self, path: &VirtualPath, target: &Path) -> PassthroughResult<Resolved> {
        trace!(path = %path, target = %target.display(), "symlink");
        let result = self.create_symlink_inner(path, target);
        self.record(result)
    }

    fn create_symlink_inner(&self, path: &VirtualPath, target: &Path) -> PassthroughResult<Resolved> {
        self.require_parent_dir(path)?;
        let lock = self.creation_lock(path);
        let result = {
            let _guard = lock.lock();
            if self.engine.lookup_regular_entry(path).is_some() {
                Err(PassthroughError::AlreadyExists(path.clone()))
            } else {
                self.registry
                    .create_symlink(path, target)
                    .and_then(|_| self.synthesize_at(path))
            }
        };
        drop(lock);
        self.drop_creation_lock(path);
        result
    }

    /// Resolves the metadata of `path`.
    pub fn stat(&self, path: &VirtualPath) -> PassthroughResult<Resolved> {
        trace!(path = %path, "stat");
        self.stats.record_metadata_op();
        let result = self.stat_inner(path);
        self.record(result)
    }

    fn stat_inner(&self, path: &VirtualPath) -> PassthroughResult<Resolved> {
        if let Some(entry) = self.registry.lookup(path) {
            if self.engine.lookup_regular_entry(path).is_some() {
                self.stats.record_inconsistency();
                error!(path = %path, kind = %entry.kind, "Path tracked by both registry and content engine");
                return Err(PassthroughError::InconsistentState(path.clone()));
            }
            return Ok(Resolved::Special(self.synthesizer.synthesize(&entry)));
        }
        self.engine
            .lookup_regular_entry(path)
            .map(Resolved::Regular)
            .ok_or_else(|| PassthroughError::NotFound(path.clone()))
    }

    /// Lends out the kernel object behind a special path.
    pub fn open_transfer(&self, path: &VirtualPath) -> PassthroughResult<TransferGuard> {
        trace!(path = %path, "open_transfer");
        let result = self.transfer(path);
        self.record(result)
    }

    fn transfer(&self, path: &VirtualPath) -> PassthroughResult<TransferGuard> {
        // The shard guard drops at the end of this statement.
        let handle = self.registry.lookup(path).map(|entry| entry.shared_handle());
        match handle {
            Some(Some(handle)) => {
                self.stats.record_transfer();
                Ok(TransferGuard {
                    path: path.clone(),
                    handle,
                })
            }
            Some(None) => Err(PassthroughError::NotTransferable(path.clone())),
            None if self.engine.lookup_regular_entry(path).is_some() => {
                Err(PassthroughError::NotTransferable(path.clone()))
            }
            None => Err(PassthroughError::NotFound(path.clone())),
        }
    }

    /// Removes a non-directory entry.
    ///
    /// Special entries are released through the registry; anything else is
    /// forwarded to the content engine, so a missing path is `NotFound`.
    pub fn remove(&self, path: &VirtualPath) -> PassthroughResult<()> {
        trace!(path = %path, "remove");
        if self.registry.remove(path) {
            self.stats.record_special_removed();
            return Ok(());
        }
        self.stats.record_regular_forwarded();
        let result = self.engine.remove_regular_entry(path).map_err(PassthroughError::from);
        self.record(result)
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &VirtualPath) -> PassthroughResult<()> {
        trace!(path = %path, "rmdir");
        let result = if self.registry.contains(path) {
            Err(PassthroughError::from(ContentError::NotADirectory(path.clone())))
        } else if self.registry.has_children(path) {
            Err(PassthroughError::from(ContentError::NotEmpty(path.clone())))
        } else {
            self.stats.record_regular_forwarded();
            self.engine.remove_directory(path).map_err(PassthroughError::from)
        };
        self.record(result)
    }

    /// Lists `dir`, merging content-engine children with special entries.
    pub fn list(&self, dir: &VirtualPath) -> PassthroughResult<Vec<DirEntry>> {
        trace!(dir = %dir, "list");
        self.stats.record_metadata_op();
        let result = self.engine.list_children(dir).map_err(PassthroughError::from).map(|regular| {
            let mut entries: Vec<DirEntry> = regular
                .into_iter()
                .map(|c| DirEntry {
                    name: c.name,
                    kind: ChildKind::Regular(c.kind),
                })
                .chain(self.registry.paths_under(dir).into_iter().map(|c| DirEntry {
                    name: c.name,
                    kind: ChildKind::Special(c.kind),
                }))
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            entries
        });
        self.record(result)
    }

    /// Returns the target of the symlink at `path`.
    pub fn read_link(&self, path: &VirtualPath) -> PassthroughResult<PathBuf> {
        let result = match self.registry.lookup(path) {
            Some(entry) => entry
                .target
                .clone()
                .ok_or_else(|| PassthroughError::from(ContentError::InvalidOperation(path.clone()))),
            None if self.engine.lookup_regular_entry(path).is_some() => {
                Err(PassthroughError::from(ContentError::InvalidOperation(path.clone())))
            }
            None => Err(PassthroughError::NotFound(path.clone())),
        };
        self.record(result)
    }

    /// Applies `setattr` changes.
    ///
    /// Special entries accept permission and timestamp changes; permission
    /// changes are mirrored onto the kernel object so the host enforces them.
    pub fn set_attributes(&self, path: &VirtualPath, changes: &AttrChanges) -> PassthroughResult<Resolved> {
        trace!(path = %path, ?changes, "set_attributes");
        self.stats.record_metadata_op();
        let result = if self.registry.contains(path) {
            self.set_special_attributes(path, changes)
        } else {
            self.stats.record_regular_forwarded();
            self.engine
                .set_attributes(path, changes)
                .map(Resolved::Regular)
                .map_err(PassthroughError::from)
        };
        self.record(result)
    }

    fn set_special_attributes(&self, path: &VirtualPath, changes: &AttrChanges) -> PassthroughResult<Resolved> {
        if changes.size.is_some() {
            return Err(ContentError::InvalidOperation(path.clone()).into());
        }
        if let Some(perm) = changes.perm {
            let shadow = self
                .registry
                .lookup(path)
                .and_then(|e| e.shadow_path().map(Path::to_path_buf));
            if let Some(shadow) = shadow {
                fs::set_permissions(&shadow, Permissions::from_mode(u32::from(perm)))
                    .map_err(|e| PassthroughError::kernel(path, e))?;
            }
        }
        self.registry.update(path, |entry| {
            if let Some(perm) = changes.perm {
                entry.perm = perm;
            }
            if let Some(atime) = changes.atime {
                entry.accessed = atime;
            }
            if let Some(mtime) = changes.mtime {
                entry.modified = mtime;
            }
        })?;
        debug!(path = %path, "Updated special file attributes");
        self.synthesize_at(path)
    }

    /// Reads from a regular file, or directly from a FIFO's kernel object.
    pub fn read(&self, path: &VirtualPath, offset: u64, size: usize) -> PassthroughResult<Bytes> {
        let result = if self.registry.contains(path) {
            self.transfer(path).and_then(|handle| {
                let mut buf = vec![0u8; size];
                let n = handle
                    .read(&mut buf)
                    .map_err(|e| PassthroughError::kernel(path, e))?;
                buf.truncate(n);
                Ok(Bytes::from(buf))
            })
        } else {
            self.stats.record_regular_forwarded();
            self.engine.read(path, offset, size).map_err(PassthroughError::from)
        };
        self.record(result)
    }

    /// Writes to a regular file, or directly to a FIFO's kernel object.
    pub fn write(&self, path: &VirtualPath, offset: u64, data: &[u8]) -> PassthroughResult<usize> {
        let result = if self.registry.contains(path) {
            self.transfer(path).and_then(|handle| {
                handle
                    .write(data)
                    .map_err(|e| PassthroughError::kernel(path, e))
            })
        } else {
            self.stats.record_regular_forwarded();
            self.engine.write(path, offset, data).map_err(PassthroughError::from)
        };
        self.record(result)
    }

    /// Opens a regular file for I/O by entry id.
    ///
    /// The entry stays readable through its id after the path is removed,
    /// until [`release_entry`](Self::release_entry).
    pub fn open_regular(&self, path: &VirtualPath) -> PassthroughResult<RegularEntry> {
        trace!(path = %path, "open_regular");
        let result = if self.registry.contains(path) {
            Err(PassthroughError::from(ContentError::InvalidOperation(path.clone())))
        } else {
            self.stats.record_regular_forwarded();
            self.engine.open_entry(path).map_err(PassthroughError::from)
        };
        self.record(result)
    }

    pub fn read_entry(&self, id: u64, offset: u64, size: usize) -> PassthroughResult<Bytes> {
        self.stats.record_regular_forwarded();
        let result = self
            .engine
            .read_entry(id, offset, size)
            .map_err(PassthroughError::from);
        self.record(result)
    }

    pub fn write_entry(&self, id: u64, offset: u64, data: &[u8]) -> PassthroughResult<usize> {
        self.stats.record_regular_forwarded();
        let result = self
            .engine
            .write_entry(id, offset, data)
            .map_err(PassthroughError::from);
        self.record(result)
    }

    pub fn release_entry(&self, id: u64) {
        trace!(id, "release_entry");
        self.engine.release_entry(id);
    }

    pub fn truncate(&self, path: &VirtualPath, size: u64) -> PassthroughResult<()> {
        let result = if self.registry.contains(path) {
            Err(PassthroughError::from(ContentError::InvalidOperation(path.clone())))
        } else {
            self.stats.record_regular_forwarded();
            self.engine.truncate(path, size).map_err(PassthroughError::from)
        };
        self.record(result)
    }

    /// Releases every kernel object. The router stays usable for regular
    /// paths.
    pub fn teardown(&mut self) {
        self.registry.teardown();
    }
}

impl std::fmt::Debug for PassthroughRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughRouter")
            .field("registry", &self.registry)
            .field("synthesizer", &self.synthesizer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::kind::{S_IFIFO, S_IFSOCK};

    fn router() -> PassthroughRouter {
        let store = MemoryContentStore::with_files([("hello", "hola\n"), ("adir/file", "foo!\n")])
            .unwrap();
        PassthroughRouter::new(Arc::new(store), &PassthroughConfig::default()).unwrap()
    }

    #[test]
    fn test_socket_create_and_stat() {
        let router = router();
        let path = VirtualPath::new("example.sock");
        let created = router.create(&path, &CreateRequest::socket(0o755)).unwrap();
        assert_eq!(created.special_kind(), Some(SpecialFileKind::Socket));

        let Resolved::Special(meta) = router.stat(&path).unwrap() else {
            panic!("expected special metadata");
        };
        assert_eq!(meta.file_type(), S_IFSOCK);
        assert!(router.engine().lookup_regular_entry(&path).is_none());
    }

    #[test]
    fn test_regular_paths_forwarded() {
        let router = router();
        let Resolved::Regular(entry) = router.stat(&VirtualPath::new("hello")).unwrap() else {
            panic!("expected regular entry");
        };
        assert_eq!(entry.size, 5);

        let path = VirtualPath::new("adir/new");
        router.create(&path, &CreateRequest::regular_file(0o644)).unwrap();
        assert_eq!(router.write(&path, 0, b"abc").unwrap(), 3);
        assert_eq!(&router.read(&path, 0, 10).unwrap()[..], b"abc");
        router.truncate(&path, 1).unwrap();
        assert_eq!(&router.read(&path, 0, 10).unwrap()[..], b"a");
        assert!(router.registry().is_empty());
    }

    #[test]
    fn test_stat_missing_is_not_found() {
        let router = router();
        let err = router.stat(&VirtualPath::new("nope")).unwrap_err();
        assert!(matches!(err, PassthroughError::NotFound(_)));
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_regular_and_special_exclusive() {
        let router = router();
        let err = router
            .create(&VirtualPath::new("hello"), &CreateRequest::socket(0o755))
            .unwrap_err();
        assert!(matches!(err, PassthroughError::AlreadyExists(_)));

        let path = VirtualPath::new("pipe");
        router.create(&path, &CreateRequest::fifo(0o644)).unwrap();
        let err = router
            .create(&path, &CreateRequest::regular_file(0o644))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);
        assert!(router.registry().paths_under(&VirtualPath::root()).len() == 1);
    }

    #[test]
    fn test_inconsistent_state_detected() {
        let store = Arc::new(MemoryContentStore::new());
        let router =
            PassthroughRouter::new(store.clone(), &PassthroughConfig::default()).unwrap();
        let path = VirtualPath::new("dup");
        router.create(&path, &CreateRequest::socket(0o755)).unwrap();
        // Bypass the router to corrupt the namespace.
        store
            .create_regular_entry(&path, RegularKind::File, 0o644)
            .unwrap();

        let err = router.stat(&path).unwrap_err();
        assert!(matches!(err, PassthroughError::InconsistentState(_)));
        assert_eq!(err.to_errno(), libc::EIO);
        assert_eq!(router.stats().snapshot().inconsistencies, 1);
    }

    #[test]
    fn test_open_transfer() {
        let router = router();
        let sock = VirtualPath::new("s.sock");
        router.create(&sock, &CreateRequest::socket(0o755)).unwrap();
        assert!(router.open_transfer(&sock).unwrap().as_listener().is_some());

        assert!(matches!(
            router.open_transfer(&VirtualPath::new("hello")),
            Err(PassthroughError::NotTransferable(_))
        ));
        assert!(matches!(
            router.open_transfer(&VirtualPath::new("missing")),
            Err(PassthroughError::NotFound(_))
        ));

        let link = VirtualPath::new("link");
        router.create_symlink(&link, Path::new("hello")).unwrap();
        assert!(matches!(
            router.open_transfer(&link),
            Err(PassthroughError::NotTransferable(_))
        ));
    }

    #[test]
    fn test_remove_routes_by_kind() {
        let router = router();
        let sock = VirtualPath::new("s.sock");
        router.create(&sock, &CreateRequest::socket(0o755)).unwrap();
        router.remove(&sock).unwrap();
        assert!(matches!(router.stat(&sock), Err(PassthroughError::NotFound(_))));

        router.remove(&VirtualPath::new("hello")).unwrap();
        let err = router.remove(&VirtualPath::new("hello")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_create_requires_parent_directory() {
        let router = router();
        let err = router
            .create(&VirtualPath::new("nodir/s.sock"), &CreateRequest::socket(0o755))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);

        let err = router
            .create(&VirtualPath::new("hello/s.sock"), &CreateRequest::socket(0o755))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTDIR);

        router
            .create(&VirtualPath::new("adir/s.sock"), &CreateRequest::socket(0o755))
            .unwrap();
    }

    #[test]
    fn test_list_merges_children() {
        let router = router();
        router
            .create(&VirtualPath::new("adir/b.fifo"), &CreateRequest::fifo(0o644))
            .unwrap();
        let entries = router.list(&VirtualPath::new("adir")).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b.fifo", "file"]);
        assert_eq!(entries[0].kind, ChildKind::Special(SpecialFileKind::Fifo));
        assert_eq!(entries[1].kind, ChildKind::Regular(RegularKind::File));
    }

    #[test]
    fn test_rmdir_with_special_child() {
        let router = router();
        let dir = VirtualPath::new("run");
        router.mkdir(&dir, 0o755, 0o022).unwrap();
        let sock = dir.join("app.sock");
        router.create(&sock, &CreateRequest::socket(0o755)).unwrap();

        let err = router.rmdir(&dir).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTEMPTY);
        assert_eq!(router.rmdir(&sock).unwrap_err().to_errno(), libc::ENOTDIR);

        router.remove(&sock).unwrap();
        router.rmdir(&dir).unwrap();
    }

    #[test]
    fn test_symlink_roundtrip() {
        let router = router();
        let link = VirtualPath::new("link");
        router.create_symlink(&link, Path::new("adir/file")).unwrap();
        assert_eq!(router.read_link(&link).unwrap(), PathBuf::from("adir/file"));
        assert_eq!(
            router.read_link(&VirtualPath::new("hello")).unwrap_err().to_errno(),
            libc::EINVAL
        );
        let err = router
            .create(&link, &CreateRequest::fifo(0o644))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);
    }

    #[test]
    fn test_fifo_read_write_through_router() {
        let router = router();
        let pipe = VirtualPath::new("pipe");
        let Resolved::Special(meta) = router.create(&pipe, &CreateRequest::fifo(0o644)).unwrap()
        else {
            panic!("expected special metadata");
        };
        assert_eq!(meta.file_type(), S_IFIFO);
        assert_eq!(router.write(&pipe, 0, b"through").unwrap(), 7);
        assert_eq!(&router.read(&pipe, 0, 64).unwrap()[..], b"through");
        assert_eq!(router.truncate(&pipe, 0).unwrap_err().to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_set_special_attributes() {
        let router = router();
        let sock = VirtualPath::new("s.sock");
        router.create(&sock, &CreateRequest::socket(0o755)).unwrap();
        let changes = AttrChanges {
            perm: Some(0o700),
            ..AttrChanges::default()
        };
        let Resolved::Special(meta) = router.set_attributes(&sock, &changes).unwrap() else {
            panic!("expected special metadata");
        };
        assert_eq!(meta.perm(), 0o700);

        let shadow = router
            .registry()
            .lookup(&sock)
            .unwrap()
            .shadow_path()
            .unwrap()
            .to_path_buf();
        assert_eq!(fs::metadata(shadow).unwrap().permissions().mode() & 0o777, 0o700);

        let truncate = AttrChanges {
            size: Some(0),
            ..AttrChanges::default()
        };
        assert_eq!(
            router.set_attributes(&sock, &truncate).unwrap_err().to_errno(),
            libc::EINVAL
        );
    }

    #[test]
    fn test_transfer_outlives_removal() {
        let router = router();
        let pipe = VirtualPath::new("pipe");
        router.create(&pipe, &CreateRequest::fifo(0o644)).unwrap();
        let guard = router.open_transfer(&pipe).unwrap();
        let shadow = guard.shadow_path().to_path_buf();

        // No registry lock is held, so removal goes through.
        router.remove(&pipe).unwrap();
        assert!(router.stat(&pipe).is_err());
        assert!(!shadow.exists());
        assert_eq!(guard.write(b"after").unwrap(), 5);
        let mut buf = [0u8; 8];
        let n = guard.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"after");
        assert_eq!(guard.path(), &pipe);
    }

    #[test]
    fn test_open_regular_survives_unlink() {
        let router = router();
        let file = VirtualPath::new("hello");
        let entry = router.open_regular(&file).unwrap();
        router.remove(&file).unwrap();
        assert_eq!(&router.read_entry(entry.id, 0, 64).unwrap()[..], b"hola\n");
        router.release_entry(entry.id);
        assert_eq!(
            router.read_entry(entry.id, 0, 64).unwrap_err().to_errno(),
            libc::EBADF
        );

        let sock = VirtualPath::new("s.sock");
        router.create(&sock, &CreateRequest::socket(0o755)).unwrap();
        assert_eq!(router.open_regular(&sock).unwrap_err().to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let router = router();
        let err = router
            .create(&VirtualPath::new("x"), &CreateRequest::new(0o170_000 | 0o644))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EINVAL);
        assert_eq!(router.stats().snapshot().errors, 1);
    }
}
