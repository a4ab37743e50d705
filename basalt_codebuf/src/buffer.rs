//! Multi-section code buffers with dynamic growth.
//!
//! A [`CodeBuffer`] owns one backing allocation carved into three fixed
//! sections (consts, insts, stubs). Emission appends bytes to a section;
//! when a section runs out of headroom the whole backing block is reallocated
//! and every section's used bytes are carried over. Because all bookkeeping
//! is offset-based, growth invalidates nothing except raw addresses a caller
//! derived itself. Positions that must survive emission are [`Locator`]s,
//! resolved only at copy-out.
//!
//! Buffers come in two modes:
//! - **dynamic**: owns growable scratch memory and supports relocations;
//!   the normal mode for compiling.
//! - **fixed**: a non-growing range with relocations disabled, for emitting
//!   directly into preallocated memory. Running out of space is a hard
//!   [`EmitError::OutOfSpace`].

use std::alloc;
use std::fmt;
use std::ptr::{self, NonNull};

use smallvec::SmallVec;

use crate::layout::{align_up, BufferLayout, SectionSizes, CODE_ENTRY_ALIGN, WORD_SIZE};
use crate::oops::OopRecorder;
use crate::reloc::{Locator, RelocError, RelocKind, RelocStream};
use crate::section::{CodeSection, SectionKind};

// =============================================================================
// Errors
// =============================================================================

/// Errors from emitting into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitError {
    /// The section is out of headroom and the buffer cannot grow.
    OutOfSpace {
        /// Section that ran out.
        section: SectionKind,
        /// Bytes the caller needed.
        requested: usize,
        /// Bytes that were available.
        available: usize,
    },
    /// The process allocator refused the backing block.
    AllocationFailed {
        /// Bytes requested from the allocator.
        bytes: usize,
    },
    /// An explicit cursor position was outside the section's range.
    InvalidOffset {
        /// Offending offset.
        offset: usize,
        /// Section capacity.
        limit: usize,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::OutOfSpace {
                section,
                requested,
                available,
            } => write!(
                f,
                "Section {} out of space: need {} bytes, {} available",
                section.name(),
                requested,
                available
            ),
            EmitError::AllocationFailed { bytes } => {
                write!(f, "Failed to allocate {} bytes of buffer memory", bytes)
            }
            EmitError::InvalidOffset { offset, limit } => {
                write!(f, "Offset {} outside section limit {}", offset, limit)
            }
        }
    }
}

impl std::error::Error for EmitError {}

/// Errors from copying a finished buffer into its final block.
///
/// These guard the two-phase size-then-fill protocol: a mismatch here would
/// otherwise overrun the destination and corrupt adjacent live code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyError {
    /// Destination block is smaller than the layout's total size.
    DestTooSmall {
        /// Bytes the layout requires.
        need: usize,
        /// Bytes the destination provides.
        have: usize,
    },
    /// The layout was not computed from this buffer's current contents.
    LayoutDrift,
    /// A relocation patch site falls outside the content region.
    PatchOutOfBounds {
        /// Offending content-relative offset.
        offset: usize,
    },
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyError::DestTooSmall { need, have } => {
                write!(f, "Destination too small: need {} bytes, have {}", need, have)
            }
            CopyError::LayoutDrift => {
                write!(f, "Layout does not match the buffer's current contents")
            }
            CopyError::PatchOutOfBounds { offset } => {
                write!(f, "Relocation patch at offset {} outside content", offset)
            }
        }
    }
}

impl std::error::Error for CopyError {}

// =============================================================================
// Backing storage
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackingKind {
    OwnedGrowable,
    OwnedFixed,
    External,
}

/// The raw block all three sections live in.
#[derive(Debug)]
struct Backing {
    ptr: NonNull<u8>,
    capacity: usize,
    kind: BackingKind,
}

impl Backing {
    fn alloc(capacity: usize, kind: BackingKind) -> Result<Self, EmitError> {
        debug_assert!(kind != BackingKind::External);
        let capacity = capacity.max(WORD_SIZE);
        let layout = alloc::Layout::from_size_align(capacity, CODE_ENTRY_ALIGN)
            .map_err(|_| EmitError::AllocationFailed { bytes: capacity })?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(EmitError::AllocationFailed { bytes: capacity })?;
        Ok(Backing {
            ptr,
            capacity,
            kind,
        })
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if self.kind != BackingKind::External {
            // Mirrors the Layout used in alloc(); capacity is never mutated.
            if let Ok(layout) = alloc::Layout::from_size_align(self.capacity, CODE_ENTRY_ALIGN) {
                unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Geometry of a buffer as it was before its most recent growth.
///
/// Retained so a caller interrupted by an expansion can audit what moved;
/// it holds no memory, only numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSnapshot {
    /// Total backing capacity before the growth.
    pub total_capacity: usize,
    /// Per-section `(used, capacity)` in layout order.
    pub sections: [(usize, usize); SectionKind::COUNT],
}

// =============================================================================
// CodeBuffer
// =============================================================================

/// A growable, three-section accumulation buffer for generated code.
pub struct CodeBuffer {
    name: String,
    backing: Backing,
    sections: [CodeSection; SectionKind::COUNT],
    recorder: OopRecorder,
    before_expand: Option<BufferSnapshot>,
    last_insn: Option<(u32, u32)>,
    expand_count: usize,
}

impl CodeBuffer {
    /// Create a dynamic buffer with the given instruction-section capacity.
    ///
    /// The consts and stubs sections start empty and grow on demand.
    pub fn new(name: &str, insts_capacity: usize) -> Result<Self, EmitError> {
        Self::with_capacities(name, 0, insts_capacity, 0)
    }

    /// Create a dynamic buffer with explicit per-section capacities.
    pub fn with_capacities(
        name: &str,
        consts_capacity: usize,
        insts_capacity: usize,
        stubs_capacity: usize,
    ) -> Result<Self, EmitError> {
        Self::build(
            name,
            [consts_capacity, insts_capacity, stubs_capacity],
            BackingKind::OwnedGrowable,
        )
    }

    /// Create a fixed-capacity buffer with relocations disabled.
    ///
    /// The whole capacity is given to the instructions section. Exhaustion
    /// is an error, never a growth event.
    pub fn fixed(name: &str, capacity: usize) -> Result<Self, EmitError> {
        Self::build(name, [0, capacity, 0], BackingKind::OwnedFixed)
    }

    /// Create a fixed buffer over caller-provided memory.
    ///
    /// The whole range is given to the instructions section; the buffer
    /// never grows, never frees the range, and has relocations disabled.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for the
    /// buffer's entire lifetime, and nothing else may access the range while
    /// the buffer is alive.
    pub unsafe fn external(name: &str, ptr: NonNull<u8>, len: usize) -> Self {
        let mut sections = [
            CodeSection::new(SectionKind::Consts),
            CodeSection::new(SectionKind::Insts),
            CodeSection::new(SectionKind::Stubs),
        ];
        sections[SectionKind::Insts.index()].initialize(0, len);
        CodeBuffer {
            name: name.to_owned(),
            backing: Backing {
                ptr,
                capacity: len,
                kind: BackingKind::External,
            },
            sections,
            recorder: OopRecorder::new(),
            before_expand: None,
            last_insn: None,
            expand_count: 0,
        }
    }

    fn build(
        name: &str,
        capacities: [usize; SectionKind::COUNT],
        kind: BackingKind,
    ) -> Result<Self, EmitError> {
        let (starts, total) = Self::place_sections(capacities);
        let backing = Backing::alloc(total, kind)?;
        let mut sections = [
            CodeSection::new(SectionKind::Consts),
            CodeSection::new(SectionKind::Insts),
            CodeSection::new(SectionKind::Stubs),
        ];
        for sec_kind in SectionKind::ALL {
            let i = sec_kind.index();
            sections[i].initialize(starts[i], capacities[i]);
        }
        Ok(CodeBuffer {
            name: name.to_owned(),
            backing,
            sections,
            recorder: OopRecorder::new(),
            before_expand: None,
            last_insn: None,
            expand_count: 0,
        })
    }

    /// Compute section base offsets for the given capacities.
    fn place_sections(capacities: [usize; SectionKind::COUNT]) -> ([usize; SectionKind::COUNT], usize) {
        let mut starts = [0usize; SectionKind::COUNT];
        let mut cursor = 0usize;
        for kind in SectionKind::ALL {
            let i = kind.index();
            cursor = align_up(cursor, kind.alignment());
            starts[i] = cursor;
            cursor += capacities[i];
        }
        (starts, cursor)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The buffer's display name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the buffer can grow and record relocations.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.backing.kind == BackingKind::OwnedGrowable
    }

    /// The section with the given kind.
    #[inline]
    pub fn section(&self, kind: SectionKind) -> &CodeSection {
        &self.sections[kind.index()]
    }

    /// The constants section.
    #[inline]
    pub fn consts(&self) -> &CodeSection {
        self.section(SectionKind::Consts)
    }

    /// The instructions section.
    #[inline]
    pub fn insts(&self) -> &CodeSection {
        self.section(SectionKind::Insts)
    }

    /// The stubs section.
    #[inline]
    pub fn stubs(&self) -> &CodeSection {
        self.section(SectionKind::Stubs)
    }

    /// Total bytes emitted across all sections.
    #[inline]
    pub fn total_content_size(&self) -> usize {
        self.sections.iter().map(|s| s.size()).sum()
    }

    /// Total encoded relocation bytes across all sections.
    #[inline]
    pub fn total_reloc_size(&self) -> usize {
        self.sections.iter().map(|s| s.reloc_size()).sum()
    }

    /// Per-section used sizes.
    #[inline]
    pub fn section_sizes(&self) -> SectionSizes {
        SectionSizes {
            consts: self.consts().size(),
            insts: self.insts().size(),
            stubs: self.stubs().size(),
        }
    }

    /// The oop/metadata recorder.
    #[inline]
    pub fn oop_recorder(&self) -> &OopRecorder {
        &self.recorder
    }

    /// Mutable access to the oop/metadata recorder.
    #[inline]
    pub fn oop_recorder_mut(&mut self) -> &mut OopRecorder {
        &mut self.recorder
    }

    /// Number of growth events so far.
    #[inline]
    pub fn expand_count(&self) -> usize {
        self.expand_count
    }

    /// Geometry as of just before the most recent growth, if any.
    #[inline]
    pub fn before_expand(&self) -> Option<&BufferSnapshot> {
        self.before_expand.as_ref()
    }

    /// The most recently noted instruction range, if still valid.
    #[inline]
    pub fn last_insn(&self) -> Option<(u32, u32)> {
        self.last_insn
    }

    /// The emitted bytes of a section.
    #[inline]
    pub fn section_bytes(&self, kind: SectionKind) -> &[u8] {
        let sec = self.section(kind);
        // In-bounds by the section invariants; valid for the backing's life.
        unsafe {
            std::slice::from_raw_parts(self.backing.ptr.as_ptr().add(sec.start()), sec.size())
        }
    }

    /// A growth-stable position at the current end of `kind`.
    #[inline]
    pub fn locator(&self, kind: SectionKind) -> Locator {
        Locator::new(kind, self.section(kind).size() as u32)
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Append raw bytes to a section.
    pub fn emit_bytes(&mut self, kind: SectionKind, bytes: &[u8]) -> Result<(), EmitError> {
        let sec = &mut self.sections[kind.index()];
        if bytes.len() > sec.remaining() {
            return Err(EmitError::OutOfSpace {
                section: kind,
                requested: bytes.len(),
                available: sec.remaining(),
            });
        }
        let dst = sec.start() + sec.size();
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.backing.ptr.as_ptr().add(dst),
                bytes.len(),
            );
        }
        sec.advance(bytes.len());
        if kind != SectionKind::Insts {
            self.last_insn = None;
        }
        Ok(())
    }

    /// Append a byte.
    #[inline]
    pub fn emit_u8(&mut self, kind: SectionKind, value: u8) -> Result<(), EmitError> {
        self.emit_bytes(kind, &[value])
    }

    /// Append a little-endian u16.
    #[inline]
    pub fn emit_u16(&mut self, kind: SectionKind, value: u16) -> Result<(), EmitError> {
        self.emit_bytes(kind, &value.to_le_bytes())
    }

    /// Append a little-endian u32.
    #[inline]
    pub fn emit_u32(&mut self, kind: SectionKind, value: u32) -> Result<(), EmitError> {
        self.emit_bytes(kind, &value.to_le_bytes())
    }

    /// Append a little-endian u64.
    #[inline]
    pub fn emit_u64(&mut self, kind: SectionKind, value: u64) -> Result<(), EmitError> {
        self.emit_bytes(kind, &value.to_le_bytes())
    }

    /// Append a little-endian i32.
    #[inline]
    pub fn emit_i32(&mut self, kind: SectionKind, value: i32) -> Result<(), EmitError> {
        self.emit_bytes(kind, &value.to_le_bytes())
    }

    /// Append a little-endian f32.
    #[inline]
    pub fn emit_f32(&mut self, kind: SectionKind, value: f32) -> Result<(), EmitError> {
        self.emit_bytes(kind, &value.to_le_bytes())
    }

    /// Append a little-endian f64.
    #[inline]
    pub fn emit_f64(&mut self, kind: SectionKind, value: f64) -> Result<(), EmitError> {
        self.emit_bytes(kind, &value.to_le_bytes())
    }

    /// Append an 8-byte address field.
    #[inline]
    pub fn emit_address(&mut self, kind: SectionKind, value: u64) -> Result<(), EmitError> {
        self.emit_bytes(kind, &value.to_le_bytes())
    }

    /// Zero-pad the section so its next byte lands on `alignment`.
    pub fn align_section(&mut self, kind: SectionKind, alignment: usize) -> Result<(), EmitError> {
        let used = self.section(kind).size();
        let padded = align_up(used, alignment);
        for _ in used..padded {
            self.emit_u8(kind, 0)?;
        }
        Ok(())
    }

    /// Move a section's write cursor to an explicit offset.
    ///
    /// Used by variable-length encoders that compute positions themselves.
    pub fn set_end(&mut self, kind: SectionKind, offset: usize) -> Result<(), EmitError> {
        let sec = &mut self.sections[kind.index()];
        if offset > sec.capacity() {
            return Err(EmitError::InvalidOffset {
                offset,
                limit: sec.capacity(),
            });
        }
        sec.set_end(offset);
        Ok(())
    }

    /// Remember the current end of a section.
    pub fn set_mark(&mut self, kind: SectionKind) {
        let end = self.section(kind).size();
        self.sections[kind.index()].set_mark(Some(end));
    }

    /// Remember an explicit position in a section.
    pub fn set_mark_at(&mut self, kind: SectionKind, offset: usize) -> Result<(), EmitError> {
        let sec = &mut self.sections[kind.index()];
        if offset > sec.size() {
            return Err(EmitError::InvalidOffset {
                offset,
                limit: sec.size(),
            });
        }
        sec.set_mark(Some(offset));
        Ok(())
    }

    /// Forget a section's remembered position.
    pub fn clear_mark(&mut self, kind: SectionKind) {
        self.sections[kind.index()].set_mark(None);
    }

    /// Note the byte range of the most recently emitted instruction.
    ///
    /// The note is dropped by the next growth event and by emission into any
    /// other section, since peephole merging across either would inspect
    /// stale geometry.
    pub fn note_insn(&mut self, start: u32, end: u32) {
        debug_assert!(start <= end && end as usize <= self.insts().size());
        self.last_insn = Some((start, end));
    }

    /// Record a relocation for a position in a section.
    pub fn relocate(
        &mut self,
        kind: SectionKind,
        offset: u32,
        format: u8,
        reloc: RelocKind,
    ) -> Result<(), RelocError> {
        if !self.is_dynamic() {
            return Err(RelocError::RelocationsDisabled);
        }
        let sec = &mut self.sections[kind.index()];
        if offset as usize > sec.capacity() {
            return Err(RelocError::OutOfRange {
                offset,
                limit: sec.capacity() as u32,
            });
        }
        sec.relocs_mut().record(offset, format, reloc)
    }

    // =========================================================================
    // Growth
    // =========================================================================

    /// Make sure `kind` has at least `amount` bytes of headroom, growing the
    /// buffer if necessary.
    ///
    /// Returns `Ok(true)` when the buffer grew. Growth reallocates the
    /// backing block: any raw address previously derived from this buffer is
    /// invalid afterwards. Offsets, marks, locators, and relocations all
    /// survive unchanged.
    pub fn ensure_remaining(&mut self, kind: SectionKind, amount: usize) -> Result<bool, EmitError> {
        if self.section(kind).remaining() >= amount {
            return Ok(false);
        }
        if self.backing.kind != BackingKind::OwnedGrowable {
            return Err(EmitError::OutOfSpace {
                section: kind,
                requested: amount,
                available: self.section(kind).remaining(),
            });
        }
        self.expand(kind, amount)?;
        Ok(true)
    }

    fn expand(&mut self, kind: SectionKind, amount: usize) -> Result<(), EmitError> {
        let snapshot = BufferSnapshot {
            total_capacity: self.backing.capacity,
            sections: [
                (self.consts().size(), self.consts().capacity()),
                (self.insts().size(), self.insts().capacity()),
                (self.stubs().size(), self.stubs().capacity()),
            ],
        };

        let mut capacities = [0usize; SectionKind::COUNT];
        for sec_kind in SectionKind::ALL {
            let i = sec_kind.index();
            let sec = &self.sections[i];
            let wanted = if sec_kind == kind {
                (sec.capacity() * 2).max(sec.size() + amount)
            } else {
                sec.capacity()
            };
            capacities[i] = align_up(wanted.max(sec.size()), sec_kind.alignment());
        }

        let (starts, total) = Self::place_sections(capacities);
        let new_backing = Backing::alloc(total, BackingKind::OwnedGrowable)?;

        for sec_kind in SectionKind::ALL {
            let i = sec_kind.index();
            let used = self.sections[i].size();
            unsafe {
                ptr::copy_nonoverlapping(
                    self.backing.ptr.as_ptr().add(self.sections[i].start()),
                    new_backing.ptr.as_ptr().add(starts[i]),
                    used,
                );
            }
            self.sections[i].initialize(starts[i], capacities[i]);
        }

        self.backing = new_backing;
        self.before_expand = Some(snapshot);
        self.last_insn = None;
        self.expand_count += 1;
        Ok(())
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Compute the final flattened layout for this buffer under a header of
    /// `header_size` bytes.
    ///
    /// Blob sizing and [`CodeBuffer::copy_to`] both consume exactly this.
    pub fn final_layout(&self, header_size: usize) -> BufferLayout {
        BufferLayout::compute(
            header_size,
            self.section_sizes(),
            self.total_reloc_size(),
            self.recorder.oops_size_in_bytes(),
            self.recorder.metadata_size_in_bytes(),
        )
    }

    /// Copy the buffer's contents into `dest` according to `layout`.
    ///
    /// Writes the relocation stream (re-based to content-relative offsets),
    /// all three sections at their final offsets, and the oop/metadata
    /// tables. `Internal` and `ExternalAddr` relocation sites are patched to
    /// absolute addresses assuming the block will live at `base_addr`. The
    /// header region `[0, header_size)` is left for the caller.
    pub fn copy_to(
        &self,
        dest: &mut [u8],
        layout: &BufferLayout,
        base_addr: usize,
    ) -> Result<(), CopyError> {
        if dest.len() < layout.total_size {
            return Err(CopyError::DestTooSmall {
                need: layout.total_size,
                have: dest.len(),
            });
        }
        // The layout must have been computed from this buffer as it is now;
        // anything else means the sizing and filling phases have diverged.
        if *layout != self.final_layout(layout.header_size) {
            return Err(CopyError::LayoutDrift);
        }

        dest[layout.reloc_offset..layout.total_size].fill(0);

        // Relocations, concatenated in section layout order and re-based to
        // content-relative offsets.
        let mut stream = RelocStream::new();
        for kind in SectionKind::ALL {
            let rebase = (layout.section_offset(kind) - layout.content_offset) as u32;
            self.section(kind)
                .relocs()
                .append_rebased(&mut stream, rebase)
                .map_err(|_| CopyError::LayoutDrift)?;
        }
        if stream.size_in_bytes() != self.total_reloc_size() {
            return Err(CopyError::LayoutDrift);
        }
        dest[layout.reloc_offset..layout.reloc_offset + stream.size_in_bytes()]
            .copy_from_slice(stream.as_bytes());

        // Section contents.
        for kind in SectionKind::ALL {
            let offset = layout.section_offset(kind);
            let bytes = self.section_bytes(kind);
            dest[offset..offset + bytes.len()].copy_from_slice(bytes);
        }

        // Patch absolute-address relocation sites now that the final base is
        // known.
        let mut patches: SmallVec<[(usize, u64); 8]> = SmallVec::new();
        for kind in SectionKind::ALL {
            let section_base = layout.section_offset(kind);
            for entry in self.section(kind).relocs().iter() {
                let target = match entry.kind {
                    RelocKind::Internal(loc) => {
                        (base_addr + layout.section_offset(loc.section) + loc.offset as usize)
                            as u64
                    }
                    RelocKind::ExternalAddr(addr) => addr,
                    _ => continue,
                };
                let site = section_base + entry.offset as usize;
                if site + WORD_SIZE > layout.content_end {
                    return Err(CopyError::PatchOutOfBounds {
                        offset: site - layout.content_offset,
                    });
                }
                patches.push((site, target));
            }
        }
        for (site, target) in patches {
            dest[site..site + WORD_SIZE].copy_from_slice(&target.to_le_bytes());
        }

        // Oop and metadata tables.
        self.recorder.copy_oops_to(
            &mut dest[layout.oops_offset..layout.oops_offset + self.recorder.oops_size_in_bytes()],
        );
        self.recorder.copy_metadata_to(
            &mut dest[layout.metadata_offset
                ..layout.metadata_offset + self.recorder.metadata_size_in_bytes()],
        );

        Ok(())
    }
}

impl fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBuffer")
            .field("name", &self.name)
            .field("capacity", &self.backing.capacity)
            .field("sections", &self.sections)
            .field("expand_count", &self.expand_count)
            .finish()
    }
}

// SAFETY: the backing block is exclusively owned by the buffer (owned modes)
// or exclusively lent to it (external mode, per the constructor contract);
// there is no interior sharing.
unsafe impl Send for CodeBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_read_back() {
        let mut buf = CodeBuffer::new("test", 64).unwrap();
        buf.emit_u8(SectionKind::Insts, 0x90).unwrap();
        buf.emit_u32(SectionKind::Insts, 0x1234_5678).unwrap();
        buf.emit_u64(SectionKind::Consts, 42).unwrap_err();

        assert_eq!(buf.insts().size(), 5);
        assert_eq!(buf.section_bytes(SectionKind::Insts), &[0x90, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_out_of_space_is_checked() {
        let mut buf = CodeBuffer::fixed("fixed", 4).unwrap();
        buf.emit_u32(SectionKind::Insts, 1).unwrap();
        let err = buf.emit_u8(SectionKind::Insts, 2).unwrap_err();
        assert_eq!(
            err,
            EmitError::OutOfSpace {
                section: SectionKind::Insts,
                requested: 1,
                available: 0
            }
        );
    }

    #[test]
    fn test_fixed_buffer_never_grows() {
        let mut buf = CodeBuffer::fixed("fixed", 8).unwrap();
        let err = buf.ensure_remaining(SectionKind::Insts, 64).unwrap_err();
        assert!(matches!(err, EmitError::OutOfSpace { .. }));
        assert_eq!(buf.expand_count(), 0);
    }

    #[test]
    fn test_fixed_buffer_rejects_relocations() {
        let mut buf = CodeBuffer::fixed("fixed", 8).unwrap();
        let err = buf
            .relocate(SectionKind::Insts, 0, 0, RelocKind::Oop(0))
            .unwrap_err();
        assert_eq!(err, RelocError::RelocationsDisabled);
    }

    #[test]
    fn test_growth_scenario_sixteen_byte_insts() {
        // Five 4-byte instructions into a 16-byte section: exactly one
        // growth, and every word readable at its original offset after.
        let mut buf = CodeBuffer::new("grow", 16).unwrap();
        let words = [0xAAAA_0001u32, 0xAAAA_0002, 0xAAAA_0003, 0xAAAA_0004, 0xAAAA_0005];
        for word in words {
            buf.ensure_remaining(SectionKind::Insts, 4).unwrap();
            buf.emit_u32(SectionKind::Insts, word).unwrap();
        }
        assert_eq!(buf.expand_count(), 1);
        assert!(buf.insts().capacity() >= 20);

        let bytes = buf.section_bytes(SectionKind::Insts);
        for (i, word) in words.iter().enumerate() {
            let offset = i * 4;
            assert_eq!(
                u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()),
                *word
            );
        }
    }

    #[test]
    fn test_growth_preserves_all_sections_and_relocs() {
        let mut buf = CodeBuffer::with_capacities("grow", 8, 8, 8).unwrap();
        buf.emit_u64(SectionKind::Consts, 0xC0FFEE).unwrap();
        buf.emit_u32(SectionKind::Insts, 0x11111111).unwrap();
        buf.emit_u16(SectionKind::Stubs, 0x2222).unwrap();
        buf.relocate(SectionKind::Insts, 0, 0, RelocKind::Oop(5)).unwrap();
        buf.set_mark(SectionKind::Insts);

        let before = (
            buf.section_bytes(SectionKind::Consts).to_vec(),
            buf.section_bytes(SectionKind::Insts).to_vec(),
            buf.section_bytes(SectionKind::Stubs).to_vec(),
        );

        buf.ensure_remaining(SectionKind::Insts, 128).unwrap();
        assert_eq!(buf.expand_count(), 1);

        assert_eq!(buf.section_bytes(SectionKind::Consts), before.0.as_slice());
        assert_eq!(buf.section_bytes(SectionKind::Insts), before.1.as_slice());
        assert_eq!(buf.section_bytes(SectionKind::Stubs), before.2.as_slice());
        assert_eq!(buf.insts().mark(), Some(4));
        assert_eq!(buf.insts().reloc_count(), 1);
        assert_eq!(buf.insts().locs_point(), 0);

        let snapshot = buf.before_expand().unwrap();
        assert_eq!(snapshot.sections[SectionKind::Insts.index()], (4, 8));
    }

    #[test]
    fn test_growth_invalidates_last_insn() {
        let mut buf = CodeBuffer::new("grow", 8).unwrap();
        buf.emit_u32(SectionKind::Insts, 1).unwrap();
        buf.note_insn(0, 4);
        assert_eq!(buf.last_insn(), Some((0, 4)));

        buf.ensure_remaining(SectionKind::Insts, 64).unwrap();
        assert_eq!(buf.last_insn(), None);
    }

    #[test]
    fn test_section_switch_invalidates_last_insn() {
        let mut buf = CodeBuffer::with_capacities("switch", 16, 16, 16).unwrap();
        buf.emit_u32(SectionKind::Insts, 1).unwrap();
        buf.note_insn(0, 4);

        // More instruction bytes leave the note alone.
        buf.emit_u32(SectionKind::Insts, 2).unwrap();
        assert_eq!(buf.last_insn(), Some((0, 4)));

        // A constant-pool emission drops it.
        buf.emit_u64(SectionKind::Consts, 0xC0FFEE).unwrap();
        assert_eq!(buf.last_insn(), None);
    }

    #[test]
    fn test_set_end_and_marks() {
        let mut buf = CodeBuffer::new("cursors", 32).unwrap();
        buf.emit_u64(SectionKind::Insts, 0).unwrap();
        buf.set_mark_at(SectionKind::Insts, 4).unwrap();

        buf.set_end(SectionKind::Insts, 16).unwrap();
        assert_eq!(buf.insts().size(), 16);

        assert!(buf.set_end(SectionKind::Insts, 999).is_err());
        assert!(buf.set_mark_at(SectionKind::Insts, 999).is_err());
    }

    #[test]
    fn test_align_section_pads_with_zeros() {
        let mut buf = CodeBuffer::new("align", 64).unwrap();
        buf.emit_u8(SectionKind::Insts, 0xFF).unwrap();
        buf.align_section(SectionKind::Insts, 8).unwrap();
        assert_eq!(buf.insts().size(), 8);
        assert_eq!(buf.section_bytes(SectionKind::Insts)[1..], [0u8; 7]);
    }

    #[test]
    fn test_layout_agreement_grid() {
        // Sizing and filling must agree byte-for-byte for every combination
        // of empty and non-empty sections and a range of header sizes.
        for consts_words in [0usize, 2] {
            for insts_bytes in [0usize, 20, 64] {
                for stubs_bytes in [0usize, 3] {
                    for header in [0usize, 8, 32, 200] {
                        let mut buf = CodeBuffer::with_capacities("grid", 64, 128, 16).unwrap();
                        for i in 0..consts_words {
                            buf.emit_u64(SectionKind::Consts, i as u64).unwrap();
                        }
                        for i in 0..insts_bytes {
                            buf.emit_u8(SectionKind::Insts, i as u8).unwrap();
                        }
                        for i in 0..stubs_bytes {
                            buf.emit_u8(SectionKind::Stubs, i as u8).unwrap();
                        }
                        if insts_bytes >= 8 {
                            buf.relocate(SectionKind::Insts, 0, 0, RelocKind::Oop(0)).unwrap();
                        }

                        let layout = buf.final_layout(header);
                        let mut dest = vec![0xA5u8; layout.total_size];
                        buf.copy_to(&mut dest, &layout, 0x10_0000).unwrap();

                        // Every emitted byte is at its layout offset.
                        let insts = &dest[layout.insts_offset..layout.insts_offset + insts_bytes];
                        // The relocated first word was patched only when a
                        // patching kind was recorded; Oop relocs leave bytes
                        // alone.
                        assert_eq!(insts, buf.section_bytes(SectionKind::Insts));
                    }
                }
            }
        }
    }

    #[test]
    fn test_copy_to_patches_internal_references() {
        let mut buf = CodeBuffer::with_capacities("patch", 32, 64, 0).unwrap();
        buf.emit_u64(SectionKind::Consts, 0x1357).unwrap();
        // An 8-byte field that should end up holding the absolute address of
        // consts byte 0.
        buf.emit_u64(SectionKind::Insts, 0).unwrap();
        buf.relocate(
            SectionKind::Insts,
            0,
            0,
            RelocKind::Internal(Locator::new(SectionKind::Consts, 0)),
        )
        .unwrap();

        let base = 0x40_0000usize;
        let layout = buf.final_layout(0);
        let mut dest = vec![0u8; layout.total_size];
        buf.copy_to(&mut dest, &layout, base).unwrap();

        let patched = u64::from_le_bytes(
            dest[layout.insts_offset..layout.insts_offset + 8].try_into().unwrap(),
        );
        assert_eq!(patched as usize, base + layout.consts_offset);
    }

    #[test]
    fn test_copy_to_rejects_stale_layout() {
        let mut buf = CodeBuffer::new("drift", 64).unwrap();
        buf.emit_u32(SectionKind::Insts, 1).unwrap();
        let layout = buf.final_layout(0);

        // Emitting after sizing invalidates the layout.
        buf.emit_u32(SectionKind::Insts, 2).unwrap();
        let mut dest = vec![0u8; layout.total_size + 64];
        assert_eq!(buf.copy_to(&mut dest, &layout, 0), Err(CopyError::LayoutDrift));
    }

    #[test]
    fn test_copy_to_rejects_small_dest() {
        let mut buf = CodeBuffer::new("small", 64).unwrap();
        buf.emit_u32(SectionKind::Insts, 1).unwrap();
        let layout = buf.final_layout(0);
        let mut dest = vec![0u8; layout.total_size - 1];
        assert!(matches!(
            buf.copy_to(&mut dest, &layout, 0),
            Err(CopyError::DestTooSmall { .. })
        ));
    }

    #[test]
    fn test_oop_tables_copied_to_data_region() {
        let mut buf = CodeBuffer::new("oops", 64).unwrap();
        let index = buf.oop_recorder_mut().find_oop_index(crate::OopHandle(0xBEEF));
        buf.emit_u64(SectionKind::Insts, 0).unwrap();
        buf.relocate(SectionKind::Insts, 0, 0, RelocKind::Oop(index)).unwrap();

        let layout = buf.final_layout(0);
        let mut dest = vec![0u8; layout.total_size];
        buf.copy_to(&mut dest, &layout, 0).unwrap();

        let oop = u64::from_le_bytes(
            dest[layout.oops_offset..layout.oops_offset + 8].try_into().unwrap(),
        );
        assert_eq!(oop, 0xBEEF);
    }
}
