//! Mounting and unmounting.
//!
//! [`spawn_mount`] starts a background FUSE session for a [`PassthroughFS`]
//! and waits for the kernel to report the mount before returning a
//! [`FuseMountHandle`]. Dropping the handle unmounts.

use crate::config::MountConfig;
use crate::filesystem::PassthroughFS;
use fuser::{BackgroundSession, MountOption};
use oxnode_core::PassthroughStats;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Upper bound for the mount syscall and for the mount to become visible.
pub const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long `Drop` waits for the session to join before forcing the unmount.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether a FUSE implementation is installed on this host.
pub fn fuse_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }
    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        false
    }
}

/// Mount options derived from a [`MountConfig`].
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype("oxnode".to_string()),
        // Permission checks happen in the kernel against synthesized modes.
        MountOption::DefaultPermissions,
    ];
    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Handle to a mounted passthrough filesystem.
///
/// Wraps the fuser `BackgroundSession`. Dropping this handle triggers unmount.
pub struct FuseMountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
    stats: Arc<PassthroughStats>,
}

impl FuseMountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Resolver counters, live for as long as the session runs.
    pub fn stats(&self) -> &Arc<PassthroughStats> {
        &self.stats
    }

    /// Unmounts and waits for the session to finish.
    ///
    /// This blocks while files on the mount are still open.
    pub fn unmount(mut self) {
        tracing::info!(mountpoint = %self.mountpoint.display(), "Unmounting FUSE filesystem");
        if let Some(session) = self.session.take() {
            session.join();
        }
        tracing::info!(mountpoint = %self.mountpoint.display(), "FUSE unmount successful");
    }

    fn force_unmount_impl(&self) {
        #[cfg(target_os = "macos")]
        {
            let _ = std::process::Command::new("umount")
                .arg("-f")
                .arg(&self.mountpoint)
                .output();
        }

        #[cfg(target_os = "linux")]
        {
            let _ = std::process::Command::new("fusermount")
                .args(["-uz"])
                .arg(&self.mountpoint)
                .output();
        }
    }
}

impl Drop for FuseMountHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::debug!("Unmounting FUSE filesystem at {}", self.mountpoint.display());

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            session.join();
            let _ = tx.send(());
        });

        if rx.recv_timeout(JOIN_TIMEOUT).is_err() {
            tracing::warn!(
                "session.join() timed out after {:?} for {}, forcing unmount",
                JOIN_TIMEOUT,
                self.mountpoint.display()
            );
            self.force_unmount_impl();
        }
    }
}

/// Mounts `fs` at `mountpoint` in a background session.
///
/// Returns once the mount is visible, i.e. once `mountpoint` reports a
/// different device than its parent directory.
pub fn spawn_mount(
    fs: PassthroughFS,
    mountpoint: &Path,
    config: &MountConfig,
) -> io::Result<FuseMountHandle> {
    tracing::info!(mountpoint = %mountpoint.display(), "Starting FUSE mount");
    if !fuse_available() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "FUSE is not available on this system",
        ));
    }
    if !mountpoint.exists() {
        std::fs::create_dir_all(mountpoint)?;
    }

    let stats = fs.stats();
    let options = mount_options(config);
    let session = spawn_mount_with_timeout(fs, mountpoint, options)?;
    let handle = FuseMountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_path_buf(),
        stats,
    };
    wait_for_mount(mountpoint)?;

    tracing::info!(mountpoint = %mountpoint.display(), "FUSE mount ready");
    Ok(handle)
}

/// Mounts `fs` at `mountpoint` and serves requests on the calling thread
/// until the filesystem is unmounted.
pub fn mount(fs: PassthroughFS, mountpoint: &Path, config: &MountConfig) -> io::Result<()> {
    fuser::mount2(fs, mountpoint, &mount_options(config))
}

/// Runs `spawn_mount2` on a helper thread so a mount syscall that blocks on
/// a stale mountpoint cannot hang the caller.
fn spawn_mount_with_timeout(
    fs: PassthroughFS,
    mountpoint: &Path,
    options: Vec<MountOption>,
) -> io::Result<BackgroundSession> {
    let mountpoint = mountpoint.to_path_buf();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = fuser::spawn_mount2(fs, &mountpoint, &options);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(MOUNT_TIMEOUT) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "Mount operation timed out - the mountpoint may be on a stale FUSE mount",
        )),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(io::Error::other("Mount thread terminated unexpectedly"))
        }
    }
}

fn wait_for_mount(mountpoint: &Path) -> io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let parent = mountpoint.parent().unwrap_or(Path::new("/"));
    let deadline = Instant::now() + MOUNT_TIMEOUT;
    while Instant::now() < deadline {
        if let (Ok(path_meta), Ok(parent_meta)) =
            (std::fs::metadata(mountpoint), std::fs::metadata(parent))
            && path_meta.dev() != parent_meta.dev()
        {
            tracing::debug!(
                "FUSE mount confirmed active at {} (dev {} != parent dev {})",
                mountpoint.display(),
                path_meta.dev(),
                parent_meta.dev()
            );
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("FUSE mount did not become ready within {MOUNT_TIMEOUT:?}"),
    ))
}
