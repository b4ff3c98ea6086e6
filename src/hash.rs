//! Fixed-output cryptographic digest over arbitrary byte spans.
//!
//! The algorithm is SHA-256, not a free choice: the on-disk chunk path bakes
//! the algorithm name into the directory structure (`INTERNAL/chunks/sha256/..`),
//! so swapping digests would mean migrating the layout (spec §4.1).

use sha2::{Digest, Sha256};
use std::fmt;

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// A 32-byte digest, displayed and stored as lowercase 64-char hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest32(pub [u8; DIGEST_LEN]);

impl Digest32 {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a lowercase 64-char hex digest. Returns `None` on malformed
    /// input (wrong length, non-hex, or uppercase — the on-disk format is
    /// strictly lowercase).
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != DIGEST_LEN * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return None;
        }
        let mut out = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Digest32(out))
    }

    /// The 2-hex shard prefix used as the first path component under a
    /// chunk root (spec §3).
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Streaming SHA-256 hasher. Thin wrapper so call sites never need to know
/// which crate backs the digest.
#[derive(Default)]
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest32 {
        let out = self.0.finalize();
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&out);
        Digest32(bytes)
    }
}

/// One-shot digest over a single byte span.
pub fn digest(data: &[u8]) -> Digest32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

/// One-shot hex-encoded digest over a single byte span.
pub fn digest_hex(data: &[u8]) -> String {
    digest(data).to_hex()
}
