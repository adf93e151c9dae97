//! FUSE filesystem implementation.
//!
//! [`PassthroughFS`] implements the fuser `Filesystem` trait by translating
//! each request into a call on the [`PassthroughRouter`]. `mknod` is where
//! `bind(2)` and `mkfifo(3)` on the mount arrive; the router backs those
//! entries with real kernel objects and everything else goes to the content
//! engine.
//!
//! Each operation is implemented as a `FuseResult`-returning method on the
//! filesystem, and the trait methods only translate results into replies.

use crate::attr::{child_file_type, resolved_attr, BLOCK_SIZE};
use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult};
use crate::handles::{DirListingEntry, FuseHandle, FuseHandleTable};
use crate::inode::{InodeTable, ROOT_INODE};
use bytes::Bytes;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;
use oxnode_core::{
    AttrChanges, ContentEngine, CreateRequest, PassthroughRouter, PassthroughStats, Resolved,
    VirtualPath,
};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, trace};

/// Logs a failed request and returns its errno.
fn errno(op: &'static str, e: &FuseError) -> c_int {
    debug!(op, error = %e, "request failed");
    e.to_errno()
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

enum IoTarget {
    Entry(u64),
    Special(VirtualPath),
}

/// FUSE filesystem backed by a passthrough router.
pub struct PassthroughFS {
    router: PassthroughRouter,
    inodes: InodeTable,
    handles: FuseHandleTable,
    config: MountConfig,
}

impl PassthroughFS {
    /// Creates a filesystem serving `engine`, with special files resolved
    /// according to `config.passthrough`.
    pub fn new(engine: Arc<dyn ContentEngine>, config: MountConfig) -> FuseResult<Self> {
        let router = PassthroughRouter::new(engine, &config.passthrough)?;
        info!(
            shadow_dir = %router.registry().shadow_dir().display(),
            "Passthrough filesystem created"
        );
        Ok(Self {
            router,
            inodes: InodeTable::new(),
            handles: FuseHandleTable::new(),
            config,
        })
    }

    pub fn router(&self) -> &PassthroughRouter {
        &self.router
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn stats(&self) -> Arc<PassthroughStats> {
        Arc::clone(self.router.stats())
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    fn path_of(&self, ino: u64) -> FuseResult<VirtualPath> {
        self.inodes.path_of(ino).ok_or(FuseError::InvalidInode(ino))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<VirtualPath> {
        let Some(name) = name.to_str() else {
            return Err(FuseError::InvalidName(name.to_string_lossy().into_owned()));
        };
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FuseError::InvalidName(name.to_string()));
        }
        Ok(self.path_of(parent)?.join(name))
    }

    fn attr(&self, ino: u64, resolved: &Resolved) -> FileAttr {
        let synth = self.router.synthesizer();
        resolved_attr(ino, resolved, synth.uid(), synth.gid())
    }

    /// Builds the reply for a freshly looked-up or created entry, counting
    /// a kernel lookup against its inode.
    fn entry_attr(&self, path: &VirtualPath, resolved: &Resolved) -> FileAttr {
        let ino = self.inodes.get_or_insert(path);
        self.attr(ino, resolved)
    }

    pub fn lookup_entry(&self, parent: u64, name: &OsStr) -> FuseResult<FileAttr> {
        let path = self.child_path(parent, name)?;
        let resolved = self.router.stat(&path)?;
        Ok(self.entry_attr(&path, &resolved))
    }

    pub fn get_attr(&self, ino: u64) -> FuseResult<FileAttr> {
        let path = self.path_of(ino)?;
        let resolved = self.router.stat(&path)?;
        Ok(self.attr(ino, &resolved))
    }

    /// Creates a node of any type. Sockets, FIFOs and device nodes become
    /// kernel objects in the registry.
    pub fn make_node(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> FuseResult<FileAttr> {
        let path = self.child_path(parent, name)?;
        let request = CreateRequest::new(mode)
            .with_umask(umask)
            .with_rdev(u64::from(rdev));
        let resolved = self.router.create(&path, &request)?;
        Ok(self.entry_attr(&path, &resolved))
    }

    pub fn make_dir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> FuseResult<FileAttr> {
        let path = self.child_path(parent, name)?;
        let resolved = self.router.mkdir(&path, mode, umask)?;
        Ok(self.entry_attr(&path, &resolved))
    }

    pub fn make_symlink(&self, parent: u64, name: &OsStr, target: &Path) -> FuseResult<FileAttr> {
        let path = self.child_path(parent, name)?;
        let resolved = self.router.create_symlink(&path, target)?;
        Ok(self.entry_attr(&path, &resolved))
    }

    pub fn read_link(&self, ino: u64) -> FuseResult<PathBuf> {
        let path = self.path_of(ino)?;
        Ok(self.router.read_link(&path)?)
    }

    pub fn remove_entry(&self, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.router.remove(&path)?;
        self.inodes.invalidate_path(&path);
        Ok(())
    }

    pub fn remove_dir(&self, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.router.rmdir(&path)?;
        self.inodes.invalidate_path(&path);
        Ok(())
    }

    pub fn set_attr(&self, ino: u64, changes: &AttrChanges) -> FuseResult<FileAttr> {
        let path = self.path_of(ino)?;
        let resolved = if changes.is_empty() {
            self.router.stat(&path)?
        } else {
            self.router.set_attributes(&path, changes)?
        };
        Ok(self.attr(ino, &resolved))
    }

    /// Allocates a file handle. Regular files are bound to their entry id,
    /// special files to their path.
    fn open_handle(&self, path: VirtualPath, resolved: &Resolved, flags: i32) -> FuseResult<u64> {
        let handle = match resolved {
            Resolved::Special(_) => FuseHandle::Special { path, flags },
            Resolved::Regular(entry) if entry.is_dir() => {
                return Err(oxnode_core::ContentError::IsADirectory(path).into());
            }
            Resolved::Regular(_) => {
                let entry = self.router.open_regular(&path)?;
                FuseHandle::File {
                    id: entry.id,
                    flags,
                }
            }
        };
        Ok(self.handles.insert_auto(handle))
    }

    pub fn open_file(&self, ino: u64, flags: i32) -> FuseResult<u64> {
        let path = self.path_of(ino)?;
        let resolved = self.router.stat(&path)?;
        self.open_handle(path, &resolved, flags)
    }

    pub fn create_file(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> FuseResult<(FileAttr, u64)> {
        let path = self.child_path(parent, name)?;
        let resolved = self
            .router
            .create(&path, &CreateRequest::new(mode).with_umask(umask))?;
        let attr = self.entry_attr(&path, &resolved);
        let fh = self.open_handle(path, &resolved, flags)?;
        Ok((attr, fh))
    }

    /// Resolves where I/O on `fh` goes, checking the handle's access mode.
    /// The handle table guard is released before returning.
    fn io_target(&self, fh: u64, access: Access) -> FuseResult<IoTarget> {
        let handle = self.handles.get(fh).ok_or(FuseError::InvalidHandle(fh))?;
        let target = match &*handle {
            FuseHandle::File { id, .. } => IoTarget::Entry(*id),
            FuseHandle::Special { path, .. } => IoTarget::Special(path.clone()),
            FuseHandle::Directory { .. } => return Err(FuseError::WrongHandleType),
        };
        let allowed = match access {
            Access::Read => handle.readable(),
            Access::Write => handle.writable(),
        };
        if !allowed {
            return Err(FuseError::WrongAccessMode(fh));
        }
        Ok(target)
    }

    pub fn read_handle(&self, fh: u64, offset: i64, size: u32) -> FuseResult<Bytes> {
        let offset = u64::try_from(offset).map_err(|_| FuseError::InvalidOffset(offset))?;
        let data = match self.io_target(fh, Access::Read)? {
            IoTarget::Entry(id) => self.router.read_entry(id, offset, size as usize)?,
            IoTarget::Special(path) => self.router.read(&path, offset, size as usize)?,
        };
        Ok(data)
    }

    pub fn write_handle(&self, fh: u64, offset: i64, data: &[u8]) -> FuseResult<usize> {
        let offset = u64::try_from(offset).map_err(|_| FuseError::InvalidOffset(offset))?;
        let written = match self.io_target(fh, Access::Write)? {
            IoTarget::Entry(id) => self.router.write_entry(id, offset, data)?,
            IoTarget::Special(path) => self.router.write(&path, offset, data)?,
        };
        Ok(written)
    }

    pub fn open_dir(&self, ino: u64) -> FuseResult<u64> {
        let path = self.path_of(ino)?;
        let listing = self.router.list(&path)?;
        let parent_ino = path
            .parent()
            .map_or(ROOT_INODE, |p| self.inodes.get_or_insert_no_lookup_inc(&p));

        let mut entries = Vec::with_capacity(listing.len() + 2);
        entries.push(DirListingEntry {
            inode: ino,
            kind: FileType::Directory,
            name: ".".to_string(),
        });
        entries.push(DirListingEntry {
            inode: parent_ino,
            kind: FileType::Directory,
            name: "..".to_string(),
        });
        for child in listing {
            let inode = self
                .inodes
                .get_or_insert_no_lookup_inc(&path.join(&child.name));
            entries.push(DirListingEntry {
                inode,
                kind: child_file_type(child.kind),
                name: child.name,
            });
        }
        Ok(self.handles.insert_auto(FuseHandle::Directory { entries }))
    }

    /// Entries of an open directory handle, starting after `offset`.
    pub fn dir_entries(&self, fh: u64, offset: i64) -> FuseResult<Vec<(i64, DirListingEntry)>> {
        let skip = usize::try_from(offset).map_err(|_| FuseError::InvalidOffset(offset))?;
        let handle = self.handles.get(fh).ok_or(FuseError::InvalidHandle(fh))?;
        let entries = handle.dir_entries().ok_or(FuseError::WrongHandleType)?;
        Ok(entries
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, e)| ((i + 1) as i64, e.clone()))
            .collect())
    }

    pub fn release_handle(&self, fh: u64) {
        match self.handles.remove(fh) {
            Some(FuseHandle::File { id, .. }) => self.router.release_entry(id),
            Some(_) => {}
            None => trace!(fh, "release of unknown handle"),
        }
    }
}

impl Filesystem for PassthroughFS {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        let stats = self.router.stats().snapshot();
        info!(?stats, "FUSE filesystem destroyed");
        self.router.teardown();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, name = ?name, "lookup");
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(errno("lookup", &e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        match self.get_attr(ino) {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(errno("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, mode = ?mode, size = ?size, "setattr");
        // Ownership changes are accepted and ignored; everything is owned by
        // the mounting user.
        let changes = AttrChanges {
            perm: mode.map(|m| (m & 0o7777) as u16),
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
        };
        match self.set_attr(ino, &changes) {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        match self.read_link(ino) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno("readlink", &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?name, mode = format_args!("{mode:#o}"), rdev, "mknod");
        match self.make_node(parent, name, mode, umask, rdev) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(errno("mknod", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?name, "mkdir");
        match self.make_dir(parent, name, mode, umask) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(errno("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "unlink");
        match self.remove_entry(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "rmdir");
        match self.remove_dir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?link_name, target = %target.display(), "symlink");
        match self.make_symlink(parent, link_name, target) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(errno("symlink", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        match self.open_file(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        match self.read_handle(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, size = data.len(), "write");
        match self.write_handle(fh, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(fh, "release");
        self.release_handle(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        match self.open_dir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("opendir", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, fh, offset, "readdir");
        match self.dir_entries(fh, offset) {
            Ok(entries) => {
                for (next, entry) in entries {
                    if reply.add(entry.inode, next, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(errno("readdir", &e)),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        trace!(fh, "releasedir");
        self.release_handle(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // Capacity is whatever backs the shadow directory.
        match nix::sys::statvfs::statvfs(self.router.registry().shadow_dir()) {
            Ok(stat) => {
                let fragment_size = stat.fragment_size() as u32;
                #[allow(clippy::useless_conversion)]
                let (blocks, bfree, bavail, files, ffree) = (
                    u64::from(stat.blocks()),
                    u64::from(stat.blocks_free()),
                    u64::from(stat.blocks_available()),
                    u64::from(stat.files()),
                    u64::from(stat.files_free()),
                );
                reply.statfs(
                    blocks,
                    bfree,
                    bavail,
                    files,
                    ffree,
                    fragment_size,
                    stat.name_max() as u32,
                    fragment_size,
                );
            }
            Err(e) => {
                debug!(error = %e, "Failed to get statfs, using defaults");
                reply.statfs(0, 0, 0, 0, 0, BLOCK_SIZE, 255, BLOCK_SIZE);
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent, name = ?name, "create");
        match self.create_file(parent, name, mode, umask, flags) {
            Ok((attr, fh)) => reply.created(&self.config.attr_ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(errno("create", &e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!(inode = ino, mask, "access");
        // Everything is owned by the mounting user; existence is the only check.
        match self.get_attr(ino) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno("access", &e)),
        }
    }
}
