//! Command-line interface: a thin driver over the library, in the
//! teacher's `cli::{Cli, Commands}` + per-command `Args` shape
//! (`cli/mod.rs`, `cli/devices.rs`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::error::Result;

#[derive(Parser)]
#[command(name = "junknas")]
#[command(about = "Content-addressed, deduplicating chunk-store filesystem node")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Mount the chunk-store filesystem at a mountpoint (requires the `fuse` feature).
    Mount(MountArgs),
    /// Report chunk-store usage, quota, and any unreferenced (orphaned) chunks, without deleting anything.
    GcDryRun(GcDryRunArgs),
    /// Print aggregate statistics for a chunk store.
    Stat(StatArgs),
}

#[derive(clap::Args)]
pub struct StoreArgs {
    /// Directory manifests (and the INTERNAL tree) live under.
    #[arg(long)]
    pub data_dir: PathBuf,
    /// Additional chunk roots, striped round-robin with `data_dir`. May be
    /// repeated.
    #[arg(long = "chunk-root")]
    pub chunk_roots: Vec<PathBuf>,
    /// Optional byte quota across all chunk roots combined.
    #[arg(long)]
    pub quota_bytes: Option<u64>,
}

impl StoreArgs {
    fn into_config(self) -> Config {
        let mut config = Config::single_root(self.data_dir);
        if !self.chunk_roots.is_empty() {
            let mut roots = config.chunk_roots.clone();
            roots.extend(self.chunk_roots);
            config = config.with_chunk_roots(roots);
        }
        if let Some(quota) = self.quota_bytes {
            config = config.with_quota_bytes(quota);
        }
        config
    }
}

#[derive(clap::Args)]
pub struct MountArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    /// Where to mount the filesystem.
    pub mountpoint: PathBuf,
}

#[derive(clap::Args)]
pub struct GcDryRunArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

#[derive(clap::Args)]
pub struct StatArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

pub mod mount {
    use super::*;

    #[cfg(feature = "fuse")]
    pub fn run(args: MountArgs) -> Result<()> {
        use crate::fsadapter::FsAdapter;
        use crate::fuse_fs::JunkNasFs;
        use crate::mesh::NullMesh;

        let config = args.store.into_config();
        let adapter = FsAdapter::new(&config, Box::new(NullMesh))?;
        let fs = JunkNasFs::new(adapter);

        tracing::info!(mountpoint = %args.mountpoint.display(), "mounting");
        fuser::mount2(
            fs,
            &args.mountpoint,
            &[fuser::MountOption::FSName("junknas".to_string())],
        )
        .map_err(crate::error::Error::Io)?;
        Ok(())
    }

    #[cfg(not(feature = "fuse"))]
    pub fn run(_args: MountArgs) -> Result<()> {
        Err(crate::error::Error::InvalidState {
            reason: "built without the `fuse` feature; mounting is unavailable".into(),
        })
    }
}

pub mod gc_dry_run {
    use super::*;
    use crate::chunkstore::ChunkStore;

    pub fn run(args: GcDryRunArgs) -> Result<()> {
        let config = args.store.into_config();
        let store = ChunkStore::new(config.chunk_roots, config.quota_bytes)?;
        let orphans = store.scan_orphans()?;
        if orphans.is_empty() {
            println!("no orphaned chunks found");
        } else {
            println!("{} orphaned chunk(s) (refcount file missing):", orphans.len());
            for digest_hex in orphans {
                println!("  {digest_hex}");
            }
        }
        Ok(())
    }
}

pub mod stat {
    use super::*;
    use crate::chunkstore::ChunkStore;

    pub fn run(args: StatArgs) -> Result<()> {
        let config = args.store.into_config();
        let store = ChunkStore::new(config.chunk_roots.clone(), config.quota_bytes)?;
        let used = store.current_usage()?;
        println!("chunk roots: {:?}", config.chunk_roots);
        println!("bytes used:  {used}");
        match config.quota_bytes {
            Some(quota) => println!("quota:       {quota} ({} free)", quota.saturating_sub(used)),
            None => println!("quota:       none"),
        }
        Ok(())
    }
}
