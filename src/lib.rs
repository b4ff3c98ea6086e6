//! # junknas-core
//!
//! The chunk-store filesystem core for a small distributed NAS node:
//! content-addressed, deduplicating, reference-counted chunk storage
//! behind a per-file manifest sidecar, exposed through a path-based
//! filesystem adapter. A `fuser`-backed mountpoint (feature `fuse`) wires
//! this to a real kernel filesystem; the WireGuard transport, HTTP
//! surface, and mesh membership protocol live outside this crate and are
//! consumed only through the [`mesh::Mesh`] contract.
//!
//! ## Components
//!
//! - [`hash`] — the fixed SHA-256 digest engine.
//! - [`chunkstore`] — sharded, multi-root, refcounted, quota-bounded blob
//!   store.
//! - [`manifeststore`] — per-file size/digest-sequence sidecar.
//! - [`handle`] — per-open working state and dirty chunk buffers.
//! - [`fsadapter`] — the path-based operation table tying the above
//!   together, plus mesh-assisted fetch/replicate.
//! - [`mesh`] — the minimal remote-fetch/replicate contract the adapter
//!   consumes.
//! - [`fuse_fs`] (feature `fuse`) — the `fuser::Filesystem` glue.

pub mod chunkstore;
pub mod cli;
pub mod config;
pub mod error;
pub mod fsadapter;
pub mod handle;
pub mod hash;
pub mod manifeststore;
pub mod mesh;

#[cfg(feature = "fuse")]
pub mod fuse_fs;

pub use error::{Error, Result};