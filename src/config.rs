//! Process-wide configuration, constructed once at startup and threaded
//! through explicitly.
//!
//! Spec §9 flags "process-wide state (fuse private data, startup verbosity
//! flag)" as a pattern that needs re-architecture: represent it as an
//! explicit value built at startup, not a global singleton. `Config` is
//! that value. Parsing an actual config *file* format is out of scope
//! (spec.md's Non-goals put configuration file parsing at the external
//! layer); this struct is what a caller — the CLI here, or an embedding
//! application — fills in however it likes.

use std::path::PathBuf;

use crate::chunkstore::CHUNK_SIZE;

/// Everything the chunk store and filesystem adapter need to know before
/// servicing their first request.
#[derive(Debug, Clone)]
pub struct Config {
    /// One or more chunk roots, striped round-robin for new chunks. The
    /// first root is primary (refcount files only ever live there).
    pub chunk_roots: Vec<PathBuf>,
    /// Directory under which manifests (file sidecars) live; this is also
    /// the backing directory user paths are mirrored into.
    pub data_dir: PathBuf,
    /// Optional byte quota across all chunk roots combined. `None` means
    /// unbounded.
    pub quota_bytes: Option<u64>,
    /// Chunk size in bytes. Fixed at `CHUNK_SIZE` by spec §3; the on-disk
    /// layout (sharded chunk paths, manifest chunk indices) is defined in
    /// terms of that constant, so this field documents the value rather
    /// than parameterizing it.
    pub chunk_size: usize,
}

impl Config {
    /// A config with a single chunk root collocated with the data
    /// directory, no quota, and the spec-mandated 1 MiB chunk size.
    pub fn single_root(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            chunk_roots: vec![data_dir.clone()],
            data_dir,
            quota_bytes: None,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_quota_bytes(mut self, quota: u64) -> Self {
        self.quota_bytes = Some(quota);
        self
    }

    pub fn with_chunk_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.chunk_roots = roots;
        self
    }
}
