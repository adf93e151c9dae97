//! FUSE mount bridge for the oxnode passthrough resolver.
//!
//! Mounts a [`ContentEngine`](oxnode_core::ContentEngine) as a FUSE
//! filesystem on which sockets, FIFOs and device nodes behave like they do
//! on a local disk: `bind(2)` on the mount yields a real listening socket,
//! and the kernel carries `connect`/`accept` traffic without the daemon
//! seeing the bytes.
//!
//! # Usage
//!
//! ```no_run
//! use oxnode_core::MemoryContentStore;
//! use oxnode_fuse::{MountConfig, PassthroughFS, spawn_mount};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config = MountConfig::default();
//! let fs = PassthroughFS::new(Arc::new(MemoryContentStore::new()), config.clone())?;
//! let handle = spawn_mount(fs, Path::new("/tmp/mnt"), &config)?;
//! // ... use the mount ...
//! handle.unmount();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod attr;
pub mod backend;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod inode;

pub use backend::{FuseMountHandle, fuse_available, mount, mount_options, spawn_mount};
pub use config::MountConfig;
pub use error::{FuseError, FuseResult};
pub use filesystem::PassthroughFS;
pub use handles::{DirListingEntry, FuseHandle, FuseHandleTable, HandleTable};
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
