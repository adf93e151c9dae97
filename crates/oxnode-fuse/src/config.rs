//! Mount configuration for the FUSE bridge.

use oxnode_core::PassthroughConfig;
use std::time::Duration;

/// Default attribute TTL handed to the kernel.
///
/// Special-file metadata is synthesized on every request, so this stays short.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Default filesystem name shown in the mount table.
pub const DEFAULT_FS_NAME: &str = "oxnode";

/// Configuration options for the FUSE mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Time-to-live for attributes and entries replied to the kernel.
    pub attr_ttl: Duration,

    /// Name reported as the mount source.
    pub fs_name: String,

    /// Allow users other than the mounting user to access the mount.
    pub allow_other: bool,

    /// Unmount automatically when the process exits.
    ///
    /// Default: true.
    pub auto_unmount: bool,

    /// Resolver settings (shadow directory, non-blocking sockets, ownership).
    pub passthrough: PassthroughConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_ATTR_TTL,
            fs_name: DEFAULT_FS_NAME.to_string(),
            allow_other: false,
            auto_unmount: true,
            passthrough: PassthroughConfig::default(),
        }
    }
}

impl MountConfig {
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    #[must_use]
    pub fn fs_name(mut self, name: impl Into<String>) -> Self {
        self.fs_name = name.into();
        self
    }

    #[must_use]
    pub fn allow_other(mut self, allow: bool) -> Self {
        self.allow_other = allow;
        self
    }

    #[must_use]
    pub fn auto_unmount(mut self, auto_unmount: bool) -> Self {
        self.auto_unmount = auto_unmount;
        self
    }

    /// Replaces the resolver settings.
    #[must_use]
    pub fn passthrough(mut self, passthrough: PassthroughConfig) -> Self {
        self.passthrough = passthrough;
        self
    }
}
