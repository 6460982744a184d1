//! The `hexfs` binary: mount a HexFS directory of six container files.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use hexfs_core::{parse_key_file, BackendKind, Filesystem, MountConfig, Owner, KEY_FILE_LEN};
use hexfs_fuse::MountOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// In-process memory; nothing survives unmount.
    Memory,
    /// Regular files with positional I/O.
    File,
    /// Memory-mapped files.
    Mmap,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Memory => Self::Memory,
            Backend::File => Self::File,
            Backend::Mmap => Self::Mmap,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "hexfs",
    about = "A user-space filesystem persisted into six container files"
)]
struct Cli {
    /// Directory holding the container files (created on first mount).
    /// Ignored for the memory backend.
    data_dir: PathBuf,

    /// Where to mount the filesystem.
    mountpoint: PathBuf,

    /// Host container implementation.
    #[arg(long, value_enum, default_value_t = Backend::Mmap)]
    backend: Backend,

    /// Approximate maximum total size in bytes; 0 means bounded only by
    /// the host.
    #[arg(long, default_value_t = 0)]
    max_size: u64,

    /// Path to a 40-byte key file; enables per-chunk authenticated
    /// encryption.
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Ask the host filesystem to punch holes for freed data blocks.
    #[arg(long)]
    punch_holes: bool,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    /// Log filter, e.g. "info" or "hexfs_core=debug".
    #[arg(long, default_value = "info")]
    log: String,
}

fn process_owner() -> Owner {
    // SAFETY: geteuid/getegid cannot fail and take no arguments.
    let uid = unsafe { libc::geteuid() };
    let gid = unsafe { libc::getegid() };
    Owner { uid, gid }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid log filter")?)
        .init();

    let key = match &cli.key_file {
        Some(path) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("cannot read key file {}", path.display()))?;
            if raw.len() != KEY_FILE_LEN {
                bail!(
                    "key file {} must be exactly {KEY_FILE_LEN} bytes, got {}",
                    path.display(),
                    raw.len()
                );
            }
            Some(parse_key_file(&raw).context("invalid key file")?)
        }
        None => None,
    };

    let backend: BackendKind = cli.backend.into();
    if backend != BackendKind::Memory && !cli.data_dir.is_dir() {
        bail!("data directory {} does not exist", cli.data_dir.display());
    }

    let config = MountConfig {
        backend,
        dir: cli.data_dir.clone(),
        max_size: cli.max_size,
        key,
        punch_holes: cli.punch_holes,
        root_owner: process_owner(),
    };

    let fs = Arc::new(
        Filesystem::mount(&config)
            .map_err(|e| anyhow::anyhow!("mount failed: {e}"))?,
    );
    info!(
        data_dir = %cli.data_dir.display(),
        mountpoint = %cli.mountpoint.display(),
        backend = ?cli.backend,
        encrypted = config.key.is_some(),
        "serving"
    );

    let options = MountOptions {
        allow_other: cli.allow_other,
        ..MountOptions::default()
    };
    hexfs_fuse::mount(Arc::clone(&fs), &cli.mountpoint, &options)
        .context("FUSE session failed")?;

    fs.unmount()
        .map_err(|e| anyhow::anyhow!("unmount failed: {e}"))?;
    Ok(())
}
