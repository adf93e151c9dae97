//! The kernel object registry.
//!
//! Maps virtual paths of special files to the host kernel objects that back
//! them. Every object lives in a private shadow directory owned by the
//! registry, outside the virtual namespace.
//!
//! # Locking
//!
//! Entries live in a `DashMap`. `create` allocates the kernel object while
//! holding the write lock of the path's shard, and `remove` releases the
//! object before giving that lock up, so for any interleaving of create and
//! remove on a path at most one kernel object exists for it. Lookups take
//! the shard's read lock only.
//!
//! Guards returned by [`KernelObjectRegistry::lookup`] hold that read lock.
//! Drop them before calling a mutating method for a path in the same shard,
//! and never do blocking I/O under one: take
//! [`RegistryEntry::shared_handle`] and drop the guard first.
//!
//! Removing an entry whose handle is shared with an in-flight transfer
//! unlinks the shadow path at once; the descriptor closes when the transfer
//! drops its reference.

use crate::config::{PassthroughConfig, SHADOW_DIR_PREFIX};
use crate::error::{PassthroughError, PassthroughResult};
use crate::handle::KernelObjectHandle;
use crate::kind::SpecialFileKind;
use crate::path::VirtualPath;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tempfile::TempDir;
use tracing::{debug, trace, warn};

/// A special file known to the registry.
#[derive(Debug)]
pub struct RegistryEntry {
    /// Path inside the mount.
    pub path: VirtualPath,
    /// Kind, fixed at creation.
    pub kind: SpecialFileKind,
    /// Registry-unique id; also names the shadow object.
    pub id: u64,
    /// Permission bits (no type bits).
    pub perm: u16,
    /// Device number for device nodes, 0 otherwise.
    pub rdev: u64,
    /// Target of a symlink entry.
    pub target: Option<PathBuf>,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub changed: SystemTime,
    pub accessed: SystemTime,
    handle: Option<Arc<KernelObjectHandle>>,
}

impl RegistryEntry {
    fn new(
        path: VirtualPath,
        kind: SpecialFileKind,
        id: u64,
        perm: u16,
        rdev: u64,
        handle: Option<KernelObjectHandle>,
        target: Option<PathBuf>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            path,
            kind,
            id,
            perm,
            rdev,
            target,
            created: now,
            modified: now,
            changed: now,
            accessed: now,
            handle: handle.map(Arc::new),
        }
    }

    /// The live kernel object, if this kind has one.
    pub fn handle(&self) -> Option<&KernelObjectHandle> {
        self.handle.as_deref()
    }

    /// A reference to the kernel object that outlives the entry guard.
    pub fn shared_handle(&self) -> Option<Arc<KernelObjectHandle>> {
        self.handle.clone()
    }

    /// Location of the kernel object on the host.
    pub fn shadow_path(&self) -> Option<&Path> {
        self.handle().map(KernelObjectHandle::shadow_path)
    }

    fn release(&mut self) -> io::Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(handle) {
            Ok(handle) => handle.release(),
            Err(shared) => shared.unlink(),
        }
    }
}

/// Borrowed view of a registry entry. Holds the shard read lock.
pub type EntryGuard<'a> = Ref<'a, VirtualPath, RegistryEntry>;

/// Snapshot of a directory child, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialChild {
    pub name: String,
    pub kind: SpecialFileKind,
    pub id: u64,
}

/// Table of live special files and the kernel objects behind them.
pub struct KernelObjectRegistry {
    entries: DashMap<VirtualPath, RegistryEntry>,
    next_id: AtomicU64,
    nonblocking: bool,
    /// Private directory holding every shadow object. Deleted on teardown.
    shadow_dir: Option<TempDir>,
    shadow_path: PathBuf,
}

impl KernelObjectRegistry {
    /// Creates a registry and its private shadow directory.
    pub fn new(config: &PassthroughConfig) -> io::Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix(SHADOW_DIR_PREFIX);
            b
        };
        let dir = match &config.shadow_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        // Only the mount owner may reach the shadow objects.
        std::fs::set_permissions(dir.path(), Permissions::from_mode(0o700))?;
        let shadow_path = dir.path().to_path_buf();
        debug!(shadow_dir = %shadow_path.display(), "Kernel object registry initialized");
        Ok(Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
            nonblocking: config.nonblocking,
            shadow_dir: Some(dir),
            shadow_path,
        })
    }

    /// The private directory holding shadow objects.
    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_path
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn shadow_location(&self, kind: SpecialFileKind, id: u64) -> PathBuf {
        let prefix = match kind {
            SpecialFileKind::Socket => 's',
            SpecialFileKind::Fifo => 'p',
            SpecialFileKind::CharDevice => 'c',
            SpecialFileKind::BlockDevice => 'b',
            SpecialFileKind::Symlink => 'l',
        };
        self.shadow_path.join(format!("{prefix}{id}"))
    }

    /// Materializes a kernel object of `kind` and binds it to `path`.
    ///
    /// Returns the new entry's id. Fails with `AlreadyExists` if `path` is
    /// taken and with `KernelResource` if the host refuses the allocation; in
    /// both cases no kernel object and no entry are left behind.
    pub fn create(
        &self,
        path: &VirtualPath,
        kind: SpecialFileKind,
        perm: u16,
        rdev: u64,
    ) -> PassthroughResult<u64> {
        if !kind.has_kernel_object() {
            return Err(PassthroughError::UnsupportedType(kind.type_bits()));
        }
        match self.entries.entry(path.clone()) {
            Entry::Occupied(_) => Err(PassthroughError::AlreadyExists(path.clone())),
            Entry::Vacant(slot) => {
                let id = self.allocate_id();
                let shadow = self.shadow_location(kind, id);
                let handle = KernelObjectHandle::allocate(kind, shadow, perm, rdev, self.nonblocking)
                    .map_err(|e| PassthroughError::kernel(path, e))?;
                let rdev = if kind.is_device() { rdev } else { 0 };
                slot.insert(RegistryEntry::new(
                    path.clone(),
                    kind,
                    id,
                    perm,
                    rdev,
                    Some(handle),
                    None,
                ));
                debug!(path = %path, kind = %kind, id, "Registered special file");
                Ok(id)
            }
        }
    }

    /// Records a symlink entry. Symlinks have no kernel object.
    pub fn create_symlink(&self, path: &VirtualPath, target: &Path) -> PassthroughResult<u64> {
        match self.entries.entry(path.clone()) {
            Entry::Occupied(_) => Err(PassthroughError::AlreadyExists(path.clone())),
            Entry::Vacant(slot) => {
                let id = self.allocate_id();
                slot.insert(RegistryEntry::new(
                    path.clone(),
                    SpecialFileKind::Symlink,
                    id,
                    0o777,
                    0,
                    None,
                    Some(target.to_path_buf()),
                ));
                debug!(path = %path, target = %target.display(), id, "Registered symlink");
                Ok(id)
            }
        }
    }

    /// Looks up the entry at `path`.
    pub fn lookup(&self, path: &VirtualPath) -> Option<EntryGuard<'_>> {
        self.entries.get(path)
    }

    /// Returns true if a special file exists at `path`.
    pub fn contains(&self, path: &VirtualPath) -> bool {
        self.entries.contains_key(path)
    }

    /// Removes the entry at `path` and releases its kernel object.
    ///
    /// Removing a path with no entry is a no-op. Returns whether an entry
    /// was removed.
    pub fn remove(&self, path: &VirtualPath) -> bool {
        match self.entries.entry(path.clone()) {
            Entry::Vacant(_) => {
                trace!(path = %path, "remove: no special entry");
                false
            }
            Entry::Occupied(mut slot) => {
                if let Err(e) = slot.get_mut().release() {
                    warn!(path = %path, error = %e, "Failed to release kernel object");
                }
                slot.remove();
                debug!(path = %path, "Removed special file");
                true
            }
        }
    }

    /// Applies a metadata-affecting change to the entry at `path`.
    ///
    /// The entry's change time is bumped after `f` runs.
    pub fn update<F>(&self, path: &VirtualPath, f: F) -> PassthroughResult<()>
    where
        F: FnOnce(&mut RegistryEntry),
    {
        let mut entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| PassthroughError::NotFound(path.clone()))?;
        f(&mut entry);
        entry.changed = SystemTime::now();
        Ok(())
    }

    /// Special entries that are direct children of `dir`, sorted by name.
    pub fn paths_under(&self, dir: &VirtualPath) -> Vec<SpecialChild> {
        let mut children: Vec<SpecialChild> = self
            .entries
            .iter()
            .filter(|e| dir.is_parent_of(e.key()))
            .filter_map(|e| {
                e.key().file_name().map(|name| SpecialChild {
                    name: name.to_string(),
                    kind: e.kind,
                    id: e.id,
                })
            })
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    /// Returns true if any special entry lives below `dir`.
    pub fn has_children(&self, dir: &VirtualPath) -> bool {
        self.entries.iter().any(|e| dir.is_parent_of(e.key()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Releases every kernel object and discards the shadow directory.
    ///
    /// Objects are released in arbitrary order; objects that were already
    /// closed or unlinked out-of-band are tolerated. Safe to call twice.
    pub fn teardown(&mut self) {
        let mut released = 0usize;
        for (path, mut entry) in std::mem::take(&mut self.entries) {
            if let Err(e) = entry.release() {
                warn!(path = %path, error = %e, "Failed to release kernel object during teardown");
            }
            released += 1;
        }
        if let Some(dir) = self.shadow_dir.take()
            && let Err(e) = dir.close()
        {
            warn!(shadow_dir = %self.shadow_path.display(), error = %e, "Failed to remove shadow directory");
        }
        debug!(released, "Kernel object registry torn down");
    }
}

impl Drop for KernelObjectRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for KernelObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelObjectRegistry")
            .field("entries", &self.entries.len())
            .field("shadow_dir", &self.shadow_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn registry() -> KernelObjectRegistry {
        KernelObjectRegistry::new(&PassthroughConfig::default()).unwrap()
    }

    fn shadow_count(registry: &KernelObjectRegistry) -> usize {
        std::fs::read_dir(registry.shadow_dir()).unwrap().count()
    }

    #[test]
    fn test_create_and_lookup_socket() {
        let reg = registry();
        let path = VirtualPath::new("example.sock");
        let id = reg.create(&path, SpecialFileKind::Socket, 0o755, 0).unwrap();

        let entry = reg.lookup(&path).unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.kind, SpecialFileKind::Socket);
        let shadow = entry.shadow_path().unwrap();
        assert!(shadow.starts_with(reg.shadow_dir()));
        assert!(std::fs::symlink_metadata(shadow).unwrap().file_type().is_socket());
    }

    #[test]
    fn test_create_twice_is_already_exists() {
        let reg = registry();
        let path = VirtualPath::new("p");
        reg.create(&path, SpecialFileKind::Fifo, 0o644, 0).unwrap();
        let err = reg.create(&path, SpecialFileKind::Socket, 0o644, 0).unwrap_err();
        assert!(matches!(err, PassthroughError::AlreadyExists(_)));
        assert_eq!(reg.lookup(&path).unwrap().kind, SpecialFileKind::Fifo);
        assert_eq!(shadow_count(&reg), 1);
    }

    #[test]
    fn test_remove_releases_object() {
        let reg = registry();
        let path = VirtualPath::new("example.sock");
        reg.create(&path, SpecialFileKind::Socket, 0o755, 0).unwrap();
        let shadow = reg.lookup(&path).unwrap().shadow_path().unwrap().to_path_buf();

        assert!(reg.remove(&path));
        assert!(reg.lookup(&path).is_none());
        assert!(!shadow.exists());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let reg = registry();
        assert!(!reg.remove(&VirtualPath::new("nope.sock")));
        assert!(!reg.remove(&VirtualPath::new("nope.sock")));
    }

    #[test]
    fn test_path_reusable_after_remove() {
        let reg = registry();
        let path = VirtualPath::new("reuse");
        let first = reg.create(&path, SpecialFileKind::Socket, 0o755, 0).unwrap();
        reg.remove(&path);
        let second = reg.create(&path, SpecialFileKind::Fifo, 0o644, 0).unwrap();
        assert_ne!(first, second);
        assert_eq!(reg.lookup(&path).unwrap().kind, SpecialFileKind::Fifo);
        assert_eq!(shadow_count(&reg), 1);
    }

    #[test]
    fn test_symlink_entry_has_no_handle() {
        let reg = registry();
        let path = VirtualPath::new("link");
        reg.create_symlink(&path, Path::new("target.txt")).unwrap();
        let entry = reg.lookup(&path).unwrap();
        assert!(entry.handle().is_none());
        assert_eq!(entry.target.as_deref(), Some(Path::new("target.txt")));
        drop(entry);
        assert_eq!(shadow_count(&reg), 0);

        let err = reg.create(&path, SpecialFileKind::Symlink, 0o777, 0).unwrap_err();
        assert!(matches!(err, PassthroughError::UnsupportedType(_)));
    }

    #[test]
    fn test_kernel_failure_leaves_no_entry() {
        // sun_path holds about 108 bytes; a deep shadow root makes bind fail
        // for every uid.
        let root = tempfile::TempDir::new().unwrap();
        let deep = root.path().join("d".repeat(120));
        std::fs::create_dir(&deep).unwrap();
        let reg = KernelObjectRegistry::new(&PassthroughConfig::default().shadow_root(&deep))
            .unwrap();

        let path = VirtualPath::new("long.sock");
        let err = reg
            .create(&path, SpecialFileKind::Socket, 0o755, 0)
            .unwrap_err();
        assert!(matches!(err, PassthroughError::KernelResource { .. }));
        assert!(err.is_retryable());
        assert!(reg.lookup(&path).is_none());
        assert!(reg.is_empty());
        assert_eq!(shadow_count(&reg), 0);

        // FIFOs have no path limit, so the registry stays usable.
        reg.create(&VirtualPath::new("p"), SpecialFileKind::Fifo, 0o644, 0)
            .unwrap();
        assert_eq!(shadow_count(&reg), 1);
    }

    #[test]
    fn test_device_failure_leaves_no_entry() {
        // Device nodes need CAP_MKNOD; skip when we have it.
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let reg = registry();
        let path = VirtualPath::new("null0");
        let err = reg
            .create(&path, SpecialFileKind::CharDevice, 0o600, 0x0103)
            .unwrap_err();
        assert!(matches!(err, PassthroughError::KernelResource { .. }));
        assert!(reg.lookup(&path).is_none());
        assert_eq!(shadow_count(&reg), 0);
    }

    #[test]
    fn test_remove_with_shared_handle_unlinks_now() {
        let reg = registry();
        let path = VirtualPath::new("busy.fifo");
        reg.create(&path, SpecialFileKind::Fifo, 0o644, 0).unwrap();
        let shared = reg.lookup(&path).unwrap().shared_handle().unwrap();
        let shadow = shared.shadow_path().to_path_buf();

        assert!(reg.remove(&path));
        assert!(reg.lookup(&path).is_none());
        assert!(!shadow.exists());
        // The holder keeps a working descriptor until it lets go.
        assert_eq!(shared.write(b"late").unwrap(), 4);
        drop(shared);
        assert_eq!(shadow_count(&reg), 0);
    }

    #[test]
    fn test_update_bumps_change_time() {
        let reg = registry();
        let path = VirtualPath::new("p");
        reg.create(&path, SpecialFileKind::Fifo, 0o644, 0).unwrap();
        let before = reg.lookup(&path).unwrap().changed;
        reg.update(&path, |e| e.perm = 0o600).unwrap();
        let entry = reg.lookup(&path).unwrap();
        assert_eq!(entry.perm, 0o600);
        assert!(entry.changed >= before);

        drop(entry);
        let err = reg.update(&VirtualPath::new("missing"), |_| {}).unwrap_err();
        assert!(matches!(err, PassthroughError::NotFound(_)));
    }

    #[test]
    fn test_paths_under() {
        let reg = registry();
        reg.create(&VirtualPath::new("run/b.sock"), SpecialFileKind::Socket, 0o755, 0)
            .unwrap();
        reg.create(&VirtualPath::new("run/a.fifo"), SpecialFileKind::Fifo, 0o644, 0)
            .unwrap();
        reg.create(&VirtualPath::new("top.sock"), SpecialFileKind::Socket, 0o755, 0)
            .unwrap();

        let names: Vec<_> = reg
            .paths_under(&VirtualPath::new("run"))
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a.fifo", "b.sock"]);
        assert_eq!(reg.paths_under(&VirtualPath::root()).len(), 1);
        assert!(reg.has_children(&VirtualPath::new("run")));
        assert!(!reg.has_children(&VirtualPath::new("other")));
    }

    #[test]
    fn test_concurrent_create_single_winner() {
        let reg = Arc::new(registry());
        let path = VirtualPath::new("race.sock");
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    reg.create(&path, SpecialFileKind::Socket, 0o755, 0)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, PassthroughError::AlreadyExists(_))));
        assert_eq!(shadow_count(&reg), 1);
    }

    #[test]
    fn test_teardown_tolerates_vanished_objects() {
        let mut reg = registry();
        let a = VirtualPath::new("a.sock");
        reg.create(&a, SpecialFileKind::Socket, 0o755, 0).unwrap();
        reg.create(&VirtualPath::new("b.fifo"), SpecialFileKind::Fifo, 0o644, 0)
            .unwrap();
        let shadow = reg.lookup(&a).unwrap().shadow_path().unwrap().to_path_buf();
        std::fs::remove_file(&shadow).unwrap();

        let dir = reg.shadow_dir().to_path_buf();
        reg.teardown();
        assert!(reg.is_empty());
        assert!(!dir.exists());
        // A second teardown (as run by Drop) is harmless.
        reg.teardown();
    }
}
