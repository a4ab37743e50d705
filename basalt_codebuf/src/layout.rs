//! Region layout arithmetic for finished code buffers.
//!
//! A finished buffer is flattened into one contiguous block:
//!
//! ```text
//! +------------------+
//! |      Header      | <- blob header, word-aligned
//! +------------------+
//! |   Relocations    | <- encoded relocation stream, word-aligned
//! +------------------+
//! |      Consts      | <- content begins, entry-aligned
//! |      Insts       | <- entry-aligned
//! |      Stubs       | <- entry-aligned
//! +------------------+
//! |    Oop table     | <- data begins, word-aligned
//! |  Metadata table  | <- word-aligned
//! +------------------+
//! ```
//!
//! The same arithmetic sizes the block *and* drives the copy into it, so the
//! two phases cannot disagree. [`BufferLayout::compute`] is the only place
//! these offsets are derived.

use crate::section::SectionKind;

/// Machine word size in bytes on all supported targets.
pub const WORD_SIZE: usize = 8;

/// Alignment required for instruction entry points.
pub const CODE_ENTRY_ALIGN: usize = 32;

/// Align `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Check whether `value` is a multiple of `alignment` (a power of two).
#[inline]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    debug_assert!(alignment.is_power_of_two());
    value & (alignment - 1) == 0
}

/// Used byte counts of a buffer's three sections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionSizes {
    /// Bytes emitted into the constants section.
    pub consts: usize,
    /// Bytes emitted into the instructions section.
    pub insts: usize,
    /// Bytes emitted into the stubs section.
    pub stubs: usize,
}

/// Computed offsets of every region in a flattened buffer.
///
/// All offsets are relative to the start of the block (byte 0 of the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// The used section byte counts the layout was computed from.
    ///
    /// Kept so two layouts compare equal only when the underlying emission
    /// state matched, not merely the rounded offsets.
    pub sizes: SectionSizes,
    /// Size of the header region, word-aligned.
    pub header_size: usize,
    /// Offset of the encoded relocation stream.
    pub reloc_offset: usize,
    /// Size of the relocation region, word-aligned.
    pub reloc_size: usize,
    /// Offset where content begins (also the consts section offset).
    pub content_offset: usize,
    /// Offset of the constants section.
    pub consts_offset: usize,
    /// Offset of the instructions section.
    pub insts_offset: usize,
    /// Offset of the stubs section.
    pub stubs_offset: usize,
    /// Offset one past the last content byte (before data padding).
    pub content_end: usize,
    /// Offset where the data region (oop + metadata tables) begins.
    pub data_offset: usize,
    /// Offset of the oop table.
    pub oops_offset: usize,
    /// Size of the oop table in bytes, word-aligned.
    pub oops_size: usize,
    /// Offset of the metadata table.
    pub metadata_offset: usize,
    /// Size of the metadata table in bytes, word-aligned.
    pub metadata_size: usize,
    /// Total block size, word-aligned.
    pub total_size: usize,
}

impl BufferLayout {
    /// Compute the layout for the given region sizes.
    ///
    /// `header_size` is the caller's header (0 for a bare copy), the section
    /// sizes are *used* bytes, and the table sizes are raw byte counts. Every
    /// rounding step performed here is the definition of the block format;
    /// sizing and copying both call this and nothing else.
    pub fn compute(
        header_size: usize,
        sizes: SectionSizes,
        reloc_size: usize,
        oops_size: usize,
        metadata_size: usize,
    ) -> Self {
        let header_size = align_up(header_size, WORD_SIZE);
        let reloc_offset = header_size;
        let reloc_size = align_up(reloc_size, WORD_SIZE);

        let content_offset = align_up(reloc_offset + reloc_size, CODE_ENTRY_ALIGN);
        let consts_offset = content_offset;
        let insts_offset = align_up(consts_offset + sizes.consts, CODE_ENTRY_ALIGN);
        let stubs_offset = align_up(insts_offset + sizes.insts, CODE_ENTRY_ALIGN);
        let content_end = stubs_offset + sizes.stubs;

        let data_offset = align_up(content_end, WORD_SIZE);
        let oops_offset = data_offset;
        let oops_size = align_up(oops_size, WORD_SIZE);
        let metadata_offset = oops_offset + oops_size;
        let metadata_size = align_up(metadata_size, WORD_SIZE);
        let total_size = align_up(metadata_offset + metadata_size, WORD_SIZE);

        BufferLayout {
            sizes,
            header_size,
            reloc_offset,
            reloc_size,
            content_offset,
            consts_offset,
            insts_offset,
            stubs_offset,
            content_end,
            data_offset,
            oops_offset,
            oops_size,
            metadata_offset,
            metadata_size,
            total_size,
        }
    }

    /// Offset of the given section within the block.
    #[inline]
    pub fn section_offset(&self, kind: SectionKind) -> usize {
        match kind {
            SectionKind::Consts => self.consts_offset,
            SectionKind::Insts => self.insts_offset,
            SectionKind::Stubs => self.stubs_offset,
        }
    }

    /// Size of the data region (oop table plus metadata table).
    #[inline]
    pub fn data_size(&self) -> usize {
        self.oops_size + self.metadata_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(31, 32), 32);
        assert_eq!(align_up(33, 32), 64);
    }

    #[test]
    fn test_empty_layout() {
        let layout = BufferLayout::compute(0, SectionSizes::default(), 0, 0, 0);
        assert_eq!(layout.header_size, 0);
        assert_eq!(layout.reloc_size, 0);
        assert_eq!(layout.content_offset, 0);
        assert_eq!(layout.content_end, 0);
        assert_eq!(layout.total_size, 0);
    }

    #[test]
    fn test_layout_region_order() {
        let sizes = SectionSizes {
            consts: 24,
            insts: 100,
            stubs: 7,
        };
        let layout = BufferLayout::compute(40, sizes, 13, 16, 8);

        assert!(layout.header_size <= layout.reloc_offset + layout.reloc_size);
        assert!(layout.reloc_offset + layout.reloc_size <= layout.content_offset);
        assert!(layout.consts_offset + sizes.consts <= layout.insts_offset);
        assert!(layout.insts_offset + sizes.insts <= layout.stubs_offset);
        assert_eq!(layout.content_end, layout.stubs_offset + sizes.stubs);
        assert!(layout.content_end <= layout.data_offset);
        assert!(layout.metadata_offset + layout.metadata_size <= layout.total_size);
    }

    #[test]
    fn test_layout_alignment_invariants() {
        for header in [0usize, 8, 24, 40, 200] {
            for consts in [0usize, 1, 24] {
                for insts in [0usize, 5, 64] {
                    for stubs in [0usize, 3] {
                        let sizes = SectionSizes {
                            consts,
                            insts,
                            stubs,
                        };
                        let layout = BufferLayout::compute(header, sizes, 11, 9, 17);
                        assert!(is_aligned(layout.header_size, WORD_SIZE));
                        assert!(is_aligned(layout.reloc_size, WORD_SIZE));
                        assert!(is_aligned(layout.content_offset, CODE_ENTRY_ALIGN));
                        assert!(is_aligned(layout.insts_offset, CODE_ENTRY_ALIGN));
                        assert!(is_aligned(layout.stubs_offset, CODE_ENTRY_ALIGN));
                        assert!(is_aligned(layout.data_offset, WORD_SIZE));
                        assert!(is_aligned(layout.total_size, WORD_SIZE));
                    }
                }
            }
        }
    }

    #[test]
    fn test_layouts_with_same_offsets_differ_by_sizes() {
        // Both insts sizes round to the same stubs offset; only the stored
        // sizes tell the two apart.
        let small = SectionSizes {
            consts: 0,
            insts: 4,
            stubs: 0,
        };
        let large = SectionSizes {
            consts: 0,
            insts: 8,
            stubs: 0,
        };
        let a = BufferLayout::compute(32, small, 0, 0, 0);
        let b = BufferLayout::compute(32, large, 0, 0, 0);
        assert_eq!(a.insts_offset, b.insts_offset);
        assert_eq!(a.total_size, b.total_size);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unaligned_header_rounded() {
        let layout = BufferLayout::compute(33, SectionSizes::default(), 0, 0, 0);
        assert_eq!(layout.header_size, 40);
    }
}
