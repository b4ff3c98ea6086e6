//! Per-file manifest sidecar: logical size plus an ordered, possibly-sparse
//! list of chunk digests.
//!
//! Restructures the teacher's `manifest.rs` (a whole-tree JSON `Snapshot`)
//! into the per-file, line-oriented text sidecar spec §6 fixes as the
//! on-disk format — the same format `original_source/src/fuse_fs.c`'s
//! `.__jnkmeta` files use. The atomic-save pattern (temp file in the same
//! directory, fsync, rename) is kept from the teacher's `Snapshot::save`/
//! `ManifestStore`.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use tracing::trace;

use crate::error::{Error, Result};
use crate::hash::Digest32;

/// Suffix appended to a logical path's backing manifest sidecar.
pub const MANIFEST_SUFFIX: &str = "__jnkmeta";

/// The parsed contents of a manifest sidecar: logical size plus a sparse
/// digest sequence (`digests[i]` is `None` for an unset/sparse slot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestData {
    pub size: u64,
    pub digests: Vec<Option<Digest32>>,
}

impl ManifestData {
    pub fn empty() -> Self {
        Self {
            size: 0,
            digests: Vec::new(),
        }
    }

    /// All digests actually referenced (skipping sparse holes) — used to
    /// build the refcount diff multiset at release.
    pub fn referenced_digests(&self) -> Vec<Digest32> {
        self.digests.iter().filter_map(|d| *d).collect()
    }
}

/// Appends the manifest suffix to a backing path, e.g. `foo.txt` →
/// `foo.txt.__jnkmeta`.
pub fn manifest_path_for(backing_path: &Path) -> std::path::PathBuf {
    let mut s = backing_path.as_os_str().to_owned();
    s.push(".");
    s.push(MANIFEST_SUFFIX);
    s.into()
}

/// Loads and atomically saves manifest sidecars. Stateless beyond the
/// format itself — callers pass the full sidecar path.
pub struct ManifestStore;

impl ManifestStore {
    /// Parses a sidecar file. `chunk` lines may appear in any order; the
    /// last occurrence of a given index wins. Unknown lines are ignored
    /// for forward compatibility (spec §6).
    pub fn load(manifest_path: &Path) -> Result<ManifestData> {
        let file = File::open(manifest_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound {
                    path: manifest_path.display().to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        let reader = BufReader::new(file);

        let mut size: Option<u64> = None;
        let mut slots: std::collections::BTreeMap<usize, Digest32> = std::collections::BTreeMap::new();

        for line in reader.lines() {
            let line = line?;
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("size") => {
                    if let Some(n) = parts.next().and_then(|s| s.parse::<u64>().ok()) {
                        size = Some(n);
                    }
                }
                Some("chunk") => {
                    let idx = parts.next().and_then(|s| s.parse::<usize>().ok());
                    let hex = parts.next();
                    if let (Some(idx), Some(hex)) = (idx, hex) {
                        if let Some(d) = Digest32::from_hex(hex) {
                            slots.insert(idx, d);
                        }
                    }
                }
                _ => {
                    // Forward-compatible: unrecognized lines are ignored.
                }
            }
        }

        let size = size.ok_or_else(|| Error::InvalidState {
            reason: format!("manifest {} has no size line", manifest_path.display()),
        })?;

        let len = slots.keys().next_back().map(|max| max + 1).unwrap_or(0);
        let mut digests = vec![None; len];
        for (idx, d) in slots {
            digests[idx] = Some(d);
        }

        Ok(ManifestData { size, digests })
    }

    /// Writes the sidecar atomically: temp file in the same directory,
    /// fsync, rename. The prior manifest remains intact (and observable)
    /// until the rename completes (spec §4.3 / P5).
    pub fn save_atomic(manifest_path: &Path, data: &ManifestData) -> Result<()> {
        let parent = manifest_path.parent().ok_or_else(|| Error::InvalidPath {
            reason: format!("manifest path {} has no parent", manifest_path.display()),
        })?;
        fs::create_dir_all(parent)?;

        let tmp_path = parent.join(format!(
            ".{}.tmp-{}",
            manifest_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("manifest"),
            std::process::id()
        ));

        {
            let mut tmp = File::create(&tmp_path)?;
            writeln!(tmp, "size {}", data.size)?;
            for (idx, slot) in data.digests.iter().enumerate() {
                if let Some(d) = slot {
                    writeln!(tmp, "chunk {idx} {}", d.to_hex())?;
                }
            }
            tmp.sync_all()?;
        }

        if let Err(e) = fs::rename(&tmp_path, manifest_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        trace!(path = %manifest_path.display(), size = data.size, "manifest saved");
        Ok(())
    }

    /// Removes a manifest sidecar. Missing is not an error here; callers
    /// (the adapter's `unlink`) check existence first per spec §4.5.
    pub fn remove(manifest_path: &Path) -> Result<()> {
        match fs::remove_file(manifest_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(manifest_path: &Path) -> bool {
        manifest_path.is_file()
    }
}
