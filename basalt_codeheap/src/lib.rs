//! Segment-granularity allocator for the Basalt code cache.
//!
//! A [`CodeHeap`] reserves one contiguous virtual address range up front and
//! allocates blocks of whole segments out of it, so installed code never
//! moves. Three structures carry the heap:
//!
//! - a segment map of one byte per segment, resolving any interior pointer
//!   back to its block header via bounded backward hops;
//! - in-place block headers forming an address-ordered intrusive free list
//!   with immediate neighbor merging;
//! - a committed-memory frontier advanced lazily as the heap fills.
//!
//! # Architecture
//!
//! - [`virtualmem`]: reserve/commit/protect primitives over the platform
//!   virtual memory interface.
//! - [`heap`]: the allocator itself.
//! - [`config`]: tunables (segment size, reservation, sweep threshold).
//! - [`stats`]: consistent accounting snapshots.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod heap;
pub mod stats;
pub mod virtualmem;

pub use config::{ConfigError, HeapConfig};
pub use heap::{BlockInfo, CodeHeap, HeapBlocks, HeapError, BLOCK_OVERHEAD};
pub use stats::HeapStats;
pub use virtualmem::{RegionError, VirtualRegion, PAGE_SIZE};
