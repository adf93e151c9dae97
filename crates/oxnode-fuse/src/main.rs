//! oxnode-mount - Mount an in-memory tree with special-file passthrough.
//!
//! Usage: oxnode-mount <mountpoint> [--file path=contents]...

use anyhow::{Context, Result};
use clap::Parser;
use oxnode_core::{MemoryContentStore, PassthroughConfig};
use oxnode_fuse::{MountConfig, PassthroughFS, spawn_mount};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "oxnode-mount")]
#[command(about = "Mount a virtual filesystem whose sockets and FIFOs are real kernel objects")]
#[command(version)]
struct Cli {
    /// Mountpoint for the filesystem
    mount: PathBuf,

    /// Directory that holds the private shadow directory (keep it short;
    /// socket paths are limited to about 100 bytes)
    #[arg(long, env = "OXNODE_SHADOW_ROOT")]
    shadow_root: Option<PathBuf>,

    /// Leave shadow sockets and FIFOs in blocking mode
    #[arg(long)]
    blocking: bool,

    /// Seed a regular file, as `path=contents` (repeatable)
    #[arg(long = "file", value_name = "PATH=CONTENTS", value_parser = parse_seed)]
    files: Vec<(String, String)>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Filesystem name shown in the mount table
    #[arg(long, default_value = oxnode_fuse::config::DEFAULT_FS_NAME)]
    fs_name: String,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_seed(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(path, contents)| (path.to_string(), contents.to_string()))
        .ok_or_else(|| format!("expected PATH=CONTENTS, got {s:?}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if !cli.mount.exists() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mount.display());
    }

    let mut passthrough = PassthroughConfig::default().nonblocking(!cli.blocking);
    if let Some(root) = &cli.shadow_root {
        passthrough = passthrough.shadow_root(root);
    }
    let config = MountConfig::default()
        .fs_name(cli.fs_name.clone())
        .allow_other(cli.allow_other)
        .passthrough(passthrough);

    let seeds = cli.files.iter().map(|(p, c)| (p.as_str(), c.as_bytes()));
    let store = MemoryContentStore::with_files(seeds).context("Failed to seed content store")?;
    let fs = PassthroughFS::new(Arc::new(store), config.clone())
        .context("Failed to initialize filesystem")?;

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!(mount = %cli.mount.display(), "Mounting filesystem (press Ctrl+C to unmount)");
    let handle = spawn_mount(fs, &cli.mount, &config).context("Failed to mount filesystem")?;
    info!("Filesystem mounted at {}", cli.mount.display());

    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    let stats = handle.stats().snapshot();
    handle.unmount();
    info!(?stats, "Filesystem unmounted");
    Ok(())
}
