//! Per-open file handle: the in-memory working copy of a file's digest
//! sequence plus its dirty chunk buffers.
//!
//! Spec §9 calls out the source's "per-open mutable state with heap-pointer
//! chains" (`dirty_chunks` as a singly linked list of owned buffers) as a
//! pattern to re-architect: here it is an ordered map from chunk index to
//! an owned fixed-size buffer (`BTreeMap<usize, Box<[u8; CHUNK_SIZE]>>`),
//! exclusively owned by the handle. The snapshot-then-diff refcount idea
//! (hold `orig_digests` at open, diff against working `digests` at release)
//! is also from that section.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::trace;

use crate::chunkstore::{ChunkStore, CHUNK_SIZE};
use crate::error::Result;
use crate::hash::{digest, Digest32};
use crate::manifeststore::ManifestData;

fn chunk_count(size: u64) -> usize {
    if size == 0 {
        0
    } else {
        ((size + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64) as usize
    }
}

/// An open file's working state: the manifest snapshot taken at open, the
/// mutable working copy, and any not-yet-committed chunk buffers.
pub struct FileHandle {
    pub meta_path: PathBuf,
    pub size: u64,
    pub digests: Vec<Option<Digest32>>,
    pub orig_size: u64,
    pub orig_digests: Vec<Option<Digest32>>,
    pub dirty: BTreeMap<usize, Box<[u8; CHUNK_SIZE]>>,
}

impl FileHandle {
    /// A handle for a freshly created (empty) file.
    pub fn for_create(meta_path: PathBuf) -> Self {
        Self {
            meta_path,
            size: 0,
            digests: Vec::new(),
            orig_size: 0,
            orig_digests: Vec::new(),
            dirty: BTreeMap::new(),
        }
    }

    /// A handle for an existing file, loaded from its manifest. The
    /// `orig_*` snapshot is a deep copy taken at open time, used purely for
    /// refcount diffing at release.
    pub fn for_open(meta_path: PathBuf, manifest: ManifestData) -> Self {
        Self {
            meta_path,
            size: manifest.size,
            digests: manifest.digests.clone(),
            orig_size: manifest.size,
            orig_digests: manifest.digests,
            dirty: BTreeMap::new(),
        }
    }

    fn digest_at(&self, index: usize) -> Option<Digest32> {
        self.digests.get(index).copied().flatten()
    }

    /// Materializes (or returns the existing) dirty buffer for chunk
    /// `index`, loading and verifying the prior on-disk contents first if
    /// one was recorded (spec §4.4).
    fn ensure_dirty(&mut self, index: usize, store: &ChunkStore) -> Result<&mut [u8; CHUNK_SIZE]> {
        if !self.dirty.contains_key(&index) {
            let mut buf = Box::new([0u8; CHUNK_SIZE]);
            if let Some(d) = self.digest_at(index) {
                let n = store.read_verified(&d, buf.as_mut_slice())?;
                // Any bytes beyond a legacy short final chunk stay zero.
                trace!(chunk = index, bytes = n, "materialized dirty buffer from disk");
            }
            self.dirty.insert(index, buf);
        }
        Ok(self.dirty.get_mut(&index).unwrap())
    }

    /// Reads `len` bytes starting at `offset`, clipped to the current
    /// working `size`. Prefers dirty buffers over disk; falls back to
    /// `store.read_verified`, then to zero-fill for sparse holes. Bytes
    /// requested beyond a chunk's on-disk length (legacy short final
    /// chunk) are zero.
    pub fn read_at(&self, store: &ChunkStore, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let end = std::cmp::min(offset + len as u64, self.size);
        let total = (end - offset) as usize;
        let mut out = vec![0u8; total];

        let mut pos = offset;
        while pos < end {
            let index = (pos / CHUNK_SIZE as u64) as usize;
            let chunk_start = index as u64 * CHUNK_SIZE as u64;
            let within = (pos - chunk_start) as usize;
            let want = std::cmp::min(CHUNK_SIZE - within, (end - pos) as usize);
            let out_off = (pos - offset) as usize;

            if let Some(buf) = self.dirty.get(&index) {
                out[out_off..out_off + want].copy_from_slice(&buf[within..within + want]);
            } else if let Some(d) = self.digest_at(index) {
                let mut chunk_buf = [0u8; CHUNK_SIZE];
                let n = store.read_verified(&d, &mut chunk_buf)?;
                let avail_end = std::cmp::min(within + want, n);
                if avail_end > within {
                    out[out_off..out_off + (avail_end - within)]
                        .copy_from_slice(&chunk_buf[within..avail_end]);
                }
                // bytes in [avail_end, within+want) stay zero (legacy short chunk).
            }
            // else: sparse hole, already zero.

            pos += want as u64;
        }

        Ok(out)
    }

    /// Writes `data` at `offset`, materializing dirty buffers as needed and
    /// growing the working size if the write extends past it (spec §4.5).
    pub fn write_at(&mut self, store: &ChunkStore, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut pos = offset;
        let mut src_off = 0usize;
        let end = offset + data.len() as u64;

        while src_off < data.len() {
            let index = (pos / CHUNK_SIZE as u64) as usize;
            let chunk_start = index as u64 * CHUNK_SIZE as u64;
            let within = (pos - chunk_start) as usize;
            let want = std::cmp::min(CHUNK_SIZE - within, data.len() - src_off);

            let buf = self.ensure_dirty(index, store)?;
            buf[within..within + want].copy_from_slice(&data[src_off..src_off + want]);

            src_off += want;
            pos += want as u64;
        }

        self.size = std::cmp::max(self.size, end);
        if self.digests.len() < chunk_count(self.size) {
            self.digests.resize(chunk_count(self.size), None);
        }
        Ok(())
    }

    /// Truncates to `new_size` (spec §4.4). Shrinking clears digests and
    /// drops dirty buffers at or beyond the new chunk count; the chunks
    /// themselves are only dereferenced at release via the refcount diff.
    /// Extending only grows `size` — the new range reads as sparse zero.
    pub fn truncate(&mut self, new_size: u64) {
        let needed = chunk_count(new_size);
        if new_size < self.size {
            self.digests.truncate(needed.min(self.digests.len()));
            self.dirty.retain(|&idx, _| idx < needed);
        }
        if self.digests.len() < needed {
            self.digests.resize(needed, None);
        }
        self.size = new_size;
    }

    /// Whether the working manifest differs from the snapshot taken at
    /// open — the adapter only rewrites the manifest file when this is
    /// true (spec §4.5 `release`).
    pub fn is_dirty(&self) -> bool {
        self.size != self.orig_size || self.digests != self.orig_digests
    }

    /// Hashes every dirty buffer over its full `CHUNK_SIZE` bytes, stores
    /// it (deduplicating via `put_if_missing`), and records its digest.
    /// Returns the digests of chunks that were freshly materialized this
    /// release, for best-effort mesh replication.
    pub fn finalize_dirty_into_store(&mut self, store: &ChunkStore) -> Result<Vec<Digest32>> {
        let mut newly_stored = Vec::new();
        for (index, buf) in std::mem::take(&mut self.dirty) {
            let d = digest(buf.as_slice());
            store.put_if_missing(&d, buf.as_slice())?;
            if index >= self.digests.len() {
                self.digests.resize(index + 1, None);
            }
            self.digests[index] = Some(d);
            newly_stored.push(d);
        }
        Ok(newly_stored)
    }

    /// The manifest data as it should be persisted right now.
    pub fn as_manifest_data(&self) -> ManifestData {
        ManifestData {
            size: self.size,
            digests: self.digests.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ChunkStore {
        ChunkStore::new(vec![dir.path().to_path_buf()], None).unwrap()
    }

    #[test]
    fn write_then_read_small_file() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut h = FileHandle::for_create(dir.path().join("a.__jnkmeta"));
        h.write_at(&s, 0, b"HELLO").unwrap();
        assert_eq!(h.size, 5);
        let out = h.read_at(&s, 0, 5).unwrap();
        assert_eq!(out, b"HELLO");
    }

    #[test]
    fn write_spanning_two_chunks() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut h = FileHandle::for_create(dir.path().join("a.__jnkmeta"));
        let mut data = vec![0x11u8; CHUNK_SIZE + 1];
        data[CHUNK_SIZE] = 0x11;
        h.write_at(&s, 0, &data).unwrap();
        assert_eq!(h.size, (CHUNK_SIZE + 1) as u64);
        assert_eq!(h.digests.len(), 2);

        let newly = h.finalize_dirty_into_store(&s).unwrap();
        assert_eq!(newly.len(), 2);
        assert!(h.digests[0].is_some());
        assert!(h.digests[1].is_some());
    }

    // B1: a single byte at N*CHUNK_SIZE-1 touches only chunk N-1.
    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    fn boundary_write_just_before_chunk_n_touches_only_chunk_n_minus_one(#[case] n: u64) {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut h = FileHandle::for_create(dir.path().join("a.__jnkmeta"));
        h.write_at(&s, n * CHUNK_SIZE as u64 - 1, b"X").unwrap();
        assert_eq!(h.dirty.len(), 1);
        assert!(h.dirty.contains_key(&((n - 1) as usize)));
    }

    // B2: a single byte at N*CHUNK_SIZE touches only chunk N.
    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    fn boundary_write_at_chunk_n_start_touches_only_chunk_n(#[case] n: u64) {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut h = FileHandle::for_create(dir.path().join("a.__jnkmeta"));
        h.write_at(&s, n * CHUNK_SIZE as u64, b"X").unwrap();
        assert_eq!(h.dirty.len(), 1);
        assert!(h.dirty.contains_key(&(n as usize)));
    }

    #[test]
    fn truncate_extend_reads_zero() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut h = FileHandle::for_create(dir.path().join("a.__jnkmeta"));
        h.truncate(5 * CHUNK_SIZE as u64);
        assert_eq!(h.size, 5 * CHUNK_SIZE as u64);
        assert!(h.digests.iter().all(|d| d.is_none()));

        let out = h.read_at(&s, 3 * CHUNK_SIZE as u64, 4096).unwrap();
        assert_eq!(out, vec![0u8; 4096]);
    }

    // B3: truncate to exactly N*CHUNK_SIZE leaves chunks [0, N) referenced.
    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    fn boundary_truncate_to_chunk_n_leaves_n_chunks_referenced(#[case] n: usize) {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut h = FileHandle::for_create(dir.path().join("a.__jnkmeta"));
        h.write_at(&s, 0, &vec![1u8; (n + 2) * CHUNK_SIZE]).unwrap();
        h.finalize_dirty_into_store(&s).unwrap();

        h.truncate((n * CHUNK_SIZE) as u64);
        assert_eq!(h.digests.len(), n);
        assert!(h.digests.iter().all(|d| d.is_some()));
    }

    #[test]
    fn read_past_size_returns_empty() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut h = FileHandle::for_create(dir.path().join("a.__jnkmeta"));
        h.write_at(&s, 0, b"hi").unwrap();
        let out = h.read_at(&s, 100, 10).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn is_dirty_tracks_divergence_from_snapshot() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let manifest = ManifestData::empty();
        let mut h = FileHandle::for_open(dir.path().join("a.__jnkmeta"), manifest);
        assert!(!h.is_dirty());
        h.write_at(&s, 0, b"x").unwrap();
        assert!(h.is_dirty());
    }
}
