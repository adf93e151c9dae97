//! Live host kernel objects backing special files.
//!
//! A [`KernelObjectHandle`] owns exactly one host resource created at a shadow
//! location: a bound, listening UNIX socket, a FIFO opened read-write, or a
//! reference to a device node. The handle is not `Clone`; the registry holds it
//! behind an `Arc` that in-flight transfers share. Releasing it closes the
//! descriptor and unlinks the shadow path.

use crate::kind::SpecialFileKind;
use nix::sys::stat::{Mode, SFlag};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// The host resource behind a handle.
#[derive(Debug)]
enum KernelObject {
    Socket(UnixListener),
    Fifo(File),
    Device(File),
}

/// Exclusively owned reference to a live host kernel object.
#[derive(Debug)]
pub struct KernelObjectHandle {
    kind: SpecialFileKind,
    object: Option<KernelObject>,
    shadow_path: PathBuf,
}

impl KernelObjectHandle {
    /// Materializes a kernel object of `kind` at `shadow_path`.
    ///
    /// Either the object exists and is fully configured when this returns
    /// `Ok`, or nothing is left behind at `shadow_path`.
    pub(crate) fn allocate(
        kind: SpecialFileKind,
        shadow_path: PathBuf,
        perm: u16,
        rdev: u64,
        nonblocking: bool,
    ) -> io::Result<Self> {
        let result = match kind {
            SpecialFileKind::Socket => allocate_socket(&shadow_path, perm, nonblocking),
            SpecialFileKind::Fifo => allocate_fifo(&shadow_path, perm, nonblocking),
            SpecialFileKind::CharDevice | SpecialFileKind::BlockDevice => {
                allocate_device(kind, &shadow_path, perm, rdev)
            }
            SpecialFileKind::Symlink => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };

        let object = result?;
        debug!(kind = %kind, shadow = %shadow_path.display(), "Allocated kernel object");
        Ok(Self {
            kind,
            object: Some(object),
            shadow_path,
        })
    }

    pub fn kind(&self) -> SpecialFileKind {
        self.kind
    }

    /// Location of the real object on the host filesystem.
    pub fn shadow_path(&self) -> &Path {
        &self.shadow_path
    }

    /// The listening socket, if this handle backs a socket.
    pub fn as_listener(&self) -> Option<&UnixListener> {
        match &self.object {
            Some(KernelObject::Socket(listener)) => Some(listener),
            _ => None,
        }
    }

    /// Accepts a pending connection on a socket handle.
    ///
    /// In non-blocking mode this fails with `WouldBlock` when nothing is
    /// pending; wait for readiness on [`as_fd`](AsFd::as_fd) first.
    pub fn accept(&self) -> io::Result<(UnixStream, SocketAddr)> {
        self.as_listener()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTSOCK))?
            .accept()
    }

    /// Opens a client connection to a socket handle.
    pub fn connect(&self) -> io::Result<UnixStream> {
        if self.kind != SpecialFileKind::Socket {
            return Err(io::Error::from_raw_os_error(libc::ENOTSOCK));
        }
        UnixStream::connect(&self.shadow_path)
    }

    /// Reads directly from a FIFO handle.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.object {
            Some(KernelObject::Fifo(file)) => (&*file).read(buf),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    /// Writes directly to a FIFO handle.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.object {
            Some(KernelObject::Fifo(file)) => (&*file).write(buf),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    /// Closes the descriptor and unlinks the shadow path.
    ///
    /// A shadow path that has already disappeared is not an error.
    pub fn release(mut self) -> io::Result<()> {
        self.release_inner()
    }

    /// Unlinks the shadow path while the descriptor stays open.
    ///
    /// Used when an entry is removed while a transfer still holds the handle;
    /// the descriptor closes when the last holder drops it.
    pub(crate) fn unlink(&self) -> io::Result<()> {
        trace!(shadow = %self.shadow_path.display(), "Unlinking busy kernel object");
        remove_shadow(&self.shadow_path)
    }

    fn release_inner(&mut self) -> io::Result<()> {
        let Some(object) = self.object.take() else {
            return Ok(());
        };
        drop(object);
        trace!(shadow = %self.shadow_path.display(), "Releasing kernel object");
        remove_shadow(&self.shadow_path)
    }
}

impl AsFd for KernelObjectHandle {
    /// # Panics
    ///
    /// Panics if called on a released handle, which the registry never lends.
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self.object.as_ref().expect("kernel object handle used after release") {
            KernelObject::Socket(listener) => listener.as_fd(),
            KernelObject::Fifo(file) | KernelObject::Device(file) => file.as_fd(),
        }
    }
}

impl Drop for KernelObjectHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            debug!(shadow = %self.shadow_path.display(), error = %e, "Failed to release kernel object on drop");
        }
    }
}

fn remove_shadow(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Removes a freshly created shadow node when a later setup step fails.
fn unlink_on_err<T>(path: &Path, result: io::Result<T>) -> io::Result<T> {
    if result.is_err()
        && let Err(cleanup) = fs::remove_file(path)
        && cleanup.kind() != io::ErrorKind::NotFound
    {
        debug!(shadow = %path.display(), error = %cleanup, "Failed to clean shadow path");
    }
    result
}

fn allocate_socket(path: &Path, perm: u16, nonblocking: bool) -> io::Result<KernelObject> {
    let listener = UnixListener::bind(path)?;
    unlink_on_err(path, configure_socket(path, listener, perm, nonblocking))
}

fn configure_socket(
    path: &Path,
    listener: UnixListener,
    perm: u16,
    nonblocking: bool,
) -> io::Result<KernelObject> {
    fs::set_permissions(path, Permissions::from_mode(u32::from(perm)))?;
    listener.set_nonblocking(nonblocking)?;
    Ok(KernelObject::Socket(listener))
}

fn allocate_fifo(path: &Path, perm: u16, nonblocking: bool) -> io::Result<KernelObject> {
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(perm.into()))?;
    unlink_on_err(path, open_fifo(path, perm, nonblocking))
}

fn open_fifo(path: &Path, perm: u16, nonblocking: bool) -> io::Result<KernelObject> {
    // mkfifo honors the process umask; restore the requested bits.
    fs::set_permissions(path, Permissions::from_mode(u32::from(perm)))?;
    // O_RDWR keeps the open from blocking until a peer appears.
    let flags = if nonblocking { libc::O_NONBLOCK } else { 0 };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(flags | libc::O_CLOEXEC)
        .open(path)?;
    Ok(KernelObject::Fifo(file))
}

#[allow(clippy::unnecessary_cast, clippy::cast_possible_wrap)]
fn allocate_device(
    kind: SpecialFileKind,
    path: &Path,
    perm: u16,
    rdev: u64,
) -> io::Result<KernelObject> {
    let sflag = if kind == SpecialFileKind::BlockDevice {
        SFlag::S_IFBLK
    } else {
        SFlag::S_IFCHR
    };
    nix::sys::stat::mknod(
        path,
        sflag,
        Mode::from_bits_truncate(perm.into()),
        rdev as libc::dev_t,
    )?;
    let file = unlink_on_err(
        path,
        OpenOptions::new()
            .read(true)
            .custom_flags(device_open_flags())
            .open(path),
    )?;
    Ok(KernelObject::Device(file))
}

/// Holds a reference to the node without opening the device itself.
#[cfg(target_os = "linux")]
fn device_open_flags() -> i32 {
    libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
fn device_open_flags() -> i32 {
    libc::O_NONBLOCK | libc::O_NOCTTY | libc::O_NOFOLLOW | libc::O_CLOEXEC
}
