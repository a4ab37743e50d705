//! Code emission buffers for the Basalt code cache.
//!
//! This crate is the front half of the code installation pipeline: a compiler
//! emits machine code and its side tables into a [`CodeBuffer`], then the
//! buffer is flattened through a [`BufferLayout`] into a single contiguous
//! block owned by the code cache. Everything here is offset-based so that
//! buffer growth during emission never invalidates recorded positions.
//!
//! # Architecture
//!
//! - [`section`]: the three fixed section kinds (consts, insts, stubs) and
//!   the per-section cursor state.
//! - [`buffer`]: the growable multi-section [`CodeBuffer`] and its checked
//!   emission API.
//! - [`reloc`]: compact, position-sorted relocation streams and the
//!   growth-stable [`Locator`] position type.
//! - [`oops`]: deduplicated managed-pointer and metadata tables recorded
//!   during emission.
//! - [`layout`]: the single flattening function both blob sizing and blob
//!   filling share, so the two phases cannot disagree.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod layout;
pub mod oops;
pub mod reloc;
pub mod section;

pub use buffer::{BufferSnapshot, CodeBuffer, CopyError, EmitError};
pub use layout::{align_up, is_aligned, BufferLayout, SectionSizes, CODE_ENTRY_ALIGN, WORD_SIZE};
pub use oops::{MetadataHandle, OopHandle, OopRecorder};
pub use reloc::{Locator, RelocEntry, RelocIter, RelocKind, RelocStream};
pub use section::{CodeSection, SectionKind};
