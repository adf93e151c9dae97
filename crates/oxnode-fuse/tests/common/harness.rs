//! Test mount harness for FUSE integration tests.
//!
//! Provides `TestMount`, which mounts a fresh in-memory tree at a temporary
//! mountpoint and unmounts it on drop.

// Not all tests use all TestMount methods
#![allow(dead_code)]

use oxnode_core::{MemoryContentStore, PassthroughConfig};
use oxnode_fuse::{FuseMountHandle, MountConfig, PassthroughFS, spawn_mount};
use std::fs::{self, Metadata};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

pub use oxnode_fuse::fuse_available;

/// A mounted passthrough filesystem for testing.
pub struct TestMount {
    handle: Option<FuseMountHandle>,
    /// Path where the filesystem is mounted.
    pub mount_path: PathBuf,
    _temp_mount: TempDir,
    _shadow_root: TempDir,
}

impl TestMount {
    /// Mount an empty tree.
    pub fn new() -> Result<Self, String> {
        Self::with_files::<[(&str, &str); 0], _, _>([])
    }

    /// Mount a tree seeded with regular files.
    pub fn with_files<I, P, C>(files: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: AsRef<[u8]>,
    {
        let temp_mount = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let mount_path = temp_mount.path().join("mnt");
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;
        let shadow_root =
            TempDir::new().map_err(|e| format!("Failed to create shadow root: {e}"))?;

        let config = MountConfig::default()
            .fs_name("oxnode-test")
            .passthrough(PassthroughConfig::default().shadow_root(shadow_root.path()));
        let store = MemoryContentStore::with_files(files)
            .map_err(|e| format!("Failed to seed store: {e}"))?;
        let fs = PassthroughFS::new(Arc::new(store), config.clone())
            .map_err(|e| format!("Failed to create PassthroughFS: {e}"))?;
        let handle =
            spawn_mount(fs, &mount_path, &config).map_err(|e| format!("Failed to mount: {e}"))?;

        // macFUSE can report the mount as ready before create() works
        thread::sleep(Duration::from_millis(100));

        Ok(Self {
            handle: Some(handle),
            mount_path,
            _temp_mount: temp_mount,
            _shadow_root: shadow_root,
        })
    }

    /// Build a full path from a relative path.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.mount_path.join(relative.trim_start_matches('/'))
    }

    pub fn handle(&self) -> &FuseMountHandle {
        self.handle.as_ref().expect("mount handle taken")
    }

    pub fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(path))
    }

    pub fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        fs::write(self.path(path), content)
    }

    pub fn lstat(&self, path: &str) -> io::Result<Metadata> {
        fs::symlink_metadata(self.path(path))
    }

    pub fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.path(path))
    }

    pub fn mkdir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.path(path))
    }

    pub fn rmdir(&self, path: &str) -> io::Result<()> {
        fs::remove_dir(self.path(path))
    }

    /// List directory entries (names only, sorted).
    pub fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(self.path(path))?
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}

impl Drop for TestMount {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.unmount();
        }
    }
}

/// Skip test if FUSE is not available.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::harness::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}
