//! The mesh collaborator contract the core consumes for remote chunk fetch
//! and replication.
//!
//! This is deliberately thin: `spec.md` scopes peer discovery, the
//! WireGuard transport, and join/bootstrap protocols to a separate mesh
//! layer, and asks the core to depend only on
//! `fetch_chunk(digest) -> bytes?` / `replicate_chunk(digest, bytes)`
//! (grounded in `original_source/include/mesh.h`'s
//! `junknas_mesh_fetch_chunk`/`junknas_mesh_replicate_chunk`).

use tracing::warn;

/// Best-effort remote chunk access. Implementations must not block
/// indefinitely; the adapter calls this with no lock held (spec §5).
pub trait Mesh: Send + Sync {
    /// Attempts to fetch a chunk's raw bytes from a peer. Returns `None` on
    /// miss or transport failure — the caller is responsible for verifying
    /// any returned bytes against `digest_hex` before trusting them.
    fn fetch_chunk(&self, digest_hex: &str) -> Option<Vec<u8>>;

    /// Fire-and-forget replication of a newly stored chunk. Failure must
    /// never propagate to the write path that triggered it.
    fn replicate_chunk(&self, digest_hex: &str, bytes: &[u8]);
}

/// The default mesh: no peers configured. Every fetch misses, every
/// replication is a no-op. Used for single-node operation and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMesh;

impl Mesh for NullMesh {
    fn fetch_chunk(&self, digest_hex: &str) -> Option<Vec<u8>> {
        warn!(digest = digest_hex, "no mesh configured, chunk fetch missed");
        None
    }

    fn replicate_chunk(&self, _digest_hex: &str, _bytes: &[u8]) {}
}
