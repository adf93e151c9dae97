//! Resolver configuration.
//!
//! Controls where shadow kernel objects live and how they are created.

use std::path::{Path, PathBuf};

/// Prefix for the private shadow directory created per registry.
pub const SHADOW_DIR_PREFIX: &str = ".oxnode-shadow-";

/// Configuration for the passthrough resolver.
///
/// Shadow sockets listen with the standard library's default backlog; it is
/// not configurable.
#[derive(Debug, Clone)]
pub struct PassthroughConfig {
    /// Directory under which the private shadow directory is created.
    ///
    /// Defaults to the system temp directory. UNIX socket paths are limited
    /// to roughly 100 bytes, so keep this short.
    pub shadow_root: Option<PathBuf>,

    /// Put shadow sockets and FIFOs into non-blocking mode at creation.
    ///
    /// Default: true.
    pub nonblocking: bool,

    /// Owner reported in synthesized metadata. Defaults to the effective
    /// user of the process.
    pub uid: Option<u32>,

    /// Group reported in synthesized metadata. Defaults to the effective
    /// group of the process.
    pub gid: Option<u32>,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            shadow_root: None,
            nonblocking: true,
            uid: None,
            gid: None,
        }
    }
}

impl PassthroughConfig {
    /// Sets the directory that will hold the shadow directory.
    #[must_use]
    pub fn shadow_root(mut self, root: impl AsRef<Path>) -> Self {
        self.shadow_root = Some(root.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    /// Sets the owner reported for special entries.
    #[must_use]
    pub fn ownership(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub(crate) fn effective_uid(&self) -> u32 {
        self.uid.unwrap_or_else(|| nix::unistd::geteuid().as_raw())
    }

    pub(crate) fn effective_gid(&self) -> u32 {
        self.gid.unwrap_or_else(|| nix::unistd::getegid().as_raw())
    }
}
