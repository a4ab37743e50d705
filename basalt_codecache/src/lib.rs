//! Installed-code management for the Basalt runtime.
//!
//! This crate ties the emission and allocation layers together: a compiler
//! finishes a [`CodeBuffer`](basalt_codebuf::CodeBuffer), describes the
//! result with a [`BlobDescriptor`], and hands both to the [`CodeCache`],
//! which sizes a heap block, fills it, and registers the resulting
//! [`CodeBlob`] for program-counter lookups.
//!
//! # Architecture
//!
//! - [`blob`]: the closed [`BlobKind`] family, the in-memory blob header,
//!   and the [`CodeBlob`] container.
//! - [`cache`]: the lock-protected cache owning one heap per code category
//!   and the blob registry.
//! - [`oopmap`]: per-stop-point managed-pointer maps attached to blobs.
//! - [`stats`]: cache-wide atomic counters.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod blob;
pub mod cache;
pub mod oopmap;
pub mod stats;

pub use blob::{
    BlobDescriptor, BlobHeader, BlobKind, CodeBlob, DeoptOffsets, BLOB_HEADER_SIZE, BLOB_MAGIC,
};
pub use cache::{AllocPolicy, CacheConfig, CacheError, CodeCache, HeapCategory};
pub use oopmap::{OopMap, OopMapSet, SlotIndex};
pub use stats::CacheStats;
