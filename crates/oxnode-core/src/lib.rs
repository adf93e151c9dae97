//! Special-file passthrough for a virtual filesystem.
//!
//! A virtual filesystem stores regular files and directories in its own
//! content engine, but sockets, FIFOs and device nodes are kernel objects:
//! `bind(2)`, `connect(2)` and `read(2)` on them must reach the host kernel
//! untouched. This crate provides the layer that makes that work:
//!
//! - [`classify`] decides whether a creation request targets a special file.
//! - [`KernelObjectRegistry`] materializes the real kernel object in a
//!   private shadow directory and owns its lifetime.
//! - [`PassthroughRouter`] is the single gate for filesystem requests,
//!   sending special paths to the registry and everything else to a
//!   [`ContentEngine`].
//! - [`MetadataSynthesizer`] answers `stat` for special files.
//!
//! # Example
//!
//! ```no_run
//! use oxnode_core::{CreateRequest, MemoryContentStore, PassthroughConfig, PassthroughRouter, VirtualPath};
//! use std::sync::Arc;
//!
//! let router = PassthroughRouter::new(Arc::new(MemoryContentStore::new()), &PassthroughConfig::default())?;
//! let path = VirtualPath::new("example.sock");
//! router.create(&path, &CreateRequest::socket(0o755))?;
//!
//! let listener = router.open_transfer(&path)?;
//! let _client = listener.connect()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod content;
pub mod error;
pub mod handle;
pub mod kind;
pub mod metadata;
pub mod path;
pub mod registry;
pub mod router;
pub mod stats;

pub use config::{PassthroughConfig, SHADOW_DIR_PREFIX};
pub use content::{
    AttrChanges, ContentEngine, MemoryContentStore, RegularChild, RegularEntry, RegularKind,
};
pub use error::{ContentError, PassthroughError, PassthroughResult, io_error_to_errno};
pub use handle::KernelObjectHandle;
pub use kind::{CreateRequest, SpecialFileKind, classify};
pub use metadata::{MetadataSynthesizer, SyntheticMetadata};
pub use path::VirtualPath;
pub use registry::{EntryGuard, KernelObjectRegistry, RegistryEntry, SpecialChild};
pub use router::{ChildKind, DirEntry, PassthroughRouter, Resolved, TransferGuard};
pub use stats::{PassthroughStats, StatsSnapshot};
