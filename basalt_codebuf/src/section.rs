//! Named sections within a code buffer.
//!
//! A [`CodeSection`] is bookkeeping for one contiguous run of bytes inside the
//! buffer's backing block: where it starts, how much has been emitted, how
//! much room remains, and the relocation stream describing its contents. The
//! bytes themselves live in the owning [`crate::CodeBuffer`]; sections hold
//! offsets only, so buffer growth never invalidates them.

use crate::layout::{CODE_ENTRY_ALIGN, WORD_SIZE};
use crate::reloc::RelocStream;

/// Identifies one of the buffer's fixed sections.
///
/// The declaration order is the physical layout order of a finished buffer:
/// constants first, then instructions, then stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SectionKind {
    /// Constant data referenced by instructions (pools, immediates).
    Consts = 0,
    /// The main instruction stream.
    Insts = 1,
    /// Out-of-line stubs (slow paths, trampolines).
    Stubs = 2,
}

impl SectionKind {
    /// Number of sections in every buffer.
    pub const COUNT: usize = 3;

    /// All kinds in layout order.
    pub const ALL: [SectionKind; Self::COUNT] =
        [SectionKind::Consts, SectionKind::Insts, SectionKind::Stubs];

    /// Index of this section within the buffer's fixed array.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Alignment required for this section's start.
    #[inline]
    pub const fn alignment(self) -> usize {
        match self {
            SectionKind::Consts => WORD_SIZE,
            SectionKind::Insts | SectionKind::Stubs => CODE_ENTRY_ALIGN,
        }
    }

    /// Human-readable section name.
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            SectionKind::Consts => "consts",
            SectionKind::Insts => "insts",
            SectionKind::Stubs => "stubs",
        }
    }
}

/// Bookkeeping for one section of a code buffer.
///
/// `start` is the section's base offset within the backing block. `end` and
/// `limit` are relative to `start`: `end` counts emitted bytes and only moves
/// through the buffer's emit calls, `limit` is the section's capacity.
/// Invariant: `mark <= end <= limit` whenever `mark` is set.
#[derive(Debug)]
pub struct CodeSection {
    kind: SectionKind,
    start: usize,
    end: usize,
    limit: usize,
    mark: Option<usize>,
    relocs: RelocStream,
}

impl CodeSection {
    pub(crate) fn new(kind: SectionKind) -> Self {
        CodeSection {
            kind,
            start: 0,
            end: 0,
            limit: 0,
            mark: None,
            relocs: RelocStream::new(),
        }
    }

    /// Bind this section to a byte range of the backing block.
    pub(crate) fn initialize(&mut self, start: usize, limit: usize) {
        self.start = start;
        self.limit = limit;
    }

    /// Which of the buffer's sections this is.
    #[inline]
    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    /// Base offset within the backing block.
    #[inline]
    pub(crate) fn start(&self) -> usize {
        self.start
    }

    /// Bytes emitted so far.
    #[inline]
    pub fn size(&self) -> usize {
        self.end
    }

    /// Capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// Bytes of headroom left before the section is full.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.end
    }

    /// Whether nothing has been emitted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// The remembered position, if one is set.
    #[inline]
    pub fn mark(&self) -> Option<usize> {
        self.mark
    }

    /// Last section offset for which a relocation was recorded.
    #[inline]
    pub fn locs_point(&self) -> usize {
        self.relocs.point() as usize
    }

    /// Size of the encoded relocation stream in bytes.
    #[inline]
    pub fn reloc_size(&self) -> usize {
        self.relocs.size_in_bytes()
    }

    /// Number of relocation records.
    #[inline]
    pub fn reloc_count(&self) -> usize {
        self.relocs.len()
    }

    /// The section's relocation stream.
    #[inline]
    pub fn relocs(&self) -> &RelocStream {
        &self.relocs
    }

    #[inline]
    pub(crate) fn relocs_mut(&mut self) -> &mut RelocStream {
        &mut self.relocs
    }

    pub(crate) fn set_mark(&mut self, offset: Option<usize>) {
        debug_assert!(offset.map_or(true, |m| m <= self.end));
        self.mark = offset;
    }

    pub(crate) fn set_end(&mut self, end: usize) {
        debug_assert!(end <= self.limit);
        self.end = end;
        if let Some(mark) = self.mark {
            if mark > end {
                self.mark = None;
            }
        }
    }

    pub(crate) fn advance(&mut self, bytes: usize) {
        debug_assert!(self.end + bytes <= self.limit);
        self.end += bytes;
    }
}
