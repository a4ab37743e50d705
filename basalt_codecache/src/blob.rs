//! Self-describing containers for installed code.
//!
//! A [`CodeBlob`] is one installed unit in the code cache: a fixed 32-byte
//! header written at the front of its heap block, followed by the flattened
//! relocation stream, the three code sections, and the oop/metadata tables,
//! all at the offsets a [`BufferLayout`] assigned them. The in-memory header
//! makes a blob identifiable from a raw pointer in a debugger or core dump;
//! the Rust-side [`CodeBlob`] value carries the richer metadata (name, oop
//! maps, deopt offsets) the runtime itself consults.
//!
//! Construction is two-phase: [`BlobDescriptor::allocation_size`] sizes the
//! heap block from the finished emission buffer, and installation fills the
//! block through the same layout, so the two can never disagree.

use std::fmt;
use std::ptr::NonNull;
use std::slice;

use basalt_codebuf::{
    BufferLayout, CodeBuffer, CopyError, MetadataHandle, OopHandle, RelocIter, WORD_SIZE,
};

use crate::oopmap::{OopMap, OopMapSet};

/// Size of the in-memory [`BlobHeader`], which doubles as the layout's
/// header region.
pub const BLOB_HEADER_SIZE: usize = 32;

/// First word of every installed blob.
pub const BLOB_MAGIC: u32 = 0xB10B_CA3E;

// =============================================================================
// Blob kinds
// =============================================================================

/// The closed set of blob kinds the cache can hold.
///
/// Dispatch on kind is by `match`, so adding a kind is a compile-checked
/// change everywhere blobs are inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlobKind {
    /// Plain scratch code with no frame, e.g. interpreter fragments.
    Buffer = 0,
    /// Calling-convention adapter between interpreted and compiled frames.
    Adapter = 1,
    /// Dispatch-table stub.
    Vtable = 2,
    /// Runtime entry stub with a known frame.
    RuntimeStub = 3,
    /// The deoptimization unpacking blob.
    Deoptimization = 4,
    /// The exception-throwing blob.
    Exception = 5,
    /// The safepoint-polling handler blob.
    Safepoint = 6,
    /// A compiled managed method.
    Method = 7,
}

impl BlobKind {
    /// All kinds, in tag order.
    pub const ALL: [BlobKind; 8] = [
        BlobKind::Buffer,
        BlobKind::Adapter,
        BlobKind::Vtable,
        BlobKind::RuntimeStub,
        BlobKind::Deoptimization,
        BlobKind::Exception,
        BlobKind::Safepoint,
        BlobKind::Method,
    ];

    /// The kind for a header tag, if valid.
    pub fn from_tag(tag: u32) -> Option<BlobKind> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Header tag for this kind.
    #[inline]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Human-readable kind name.
    pub const fn name(self) -> &'static str {
        match self {
            BlobKind::Buffer => "buffer blob",
            BlobKind::Adapter => "adapter blob",
            BlobKind::Vtable => "vtable blob",
            BlobKind::RuntimeStub => "runtime stub",
            BlobKind::Deoptimization => "deoptimization blob",
            BlobKind::Exception => "exception blob",
            BlobKind::Safepoint => "safepoint blob",
            BlobKind::Method => "method blob",
        }
    }

    /// Whether this kind is a compiled managed method.
    #[inline]
    pub const fn is_method(self) -> bool {
        matches!(self, BlobKind::Method)
    }

    /// Whether frames of this kind can be walked by the stack crawler.
    #[inline]
    pub const fn has_frame(self) -> bool {
        matches!(
            self,
            BlobKind::RuntimeStub
                | BlobKind::Deoptimization
                | BlobKind::Exception
                | BlobKind::Safepoint
                | BlobKind::Method
        )
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Deoptimization offsets
// =============================================================================

/// Entry offsets into the deoptimization blob's code, relative to code
/// begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptOffsets {
    /// Normal frame-unpacking entry.
    pub unpack: u32,
    /// Entry taken with a pending exception.
    pub unpack_with_exception: u32,
    /// Entry that re-executes the deoptimizing instruction.
    pub unpack_with_reexecution: u32,
}

// =============================================================================
// In-memory header
// =============================================================================

/// The fixed header written at the front of every installed blob.
///
/// Must stay exactly [`BLOB_HEADER_SIZE`] bytes and field-order stable, so
/// external tools can parse it from raw memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    /// Always [`BLOB_MAGIC`].
    pub magic: u32,
    /// [`BlobKind`] tag.
    pub kind: u32,
    /// Total blob bytes, this header included.
    pub total_size: u32,
    /// Offset of the relocation stream.
    pub reloc_offset: u32,
    /// Offset of the first content byte (the consts section).
    pub content_offset: u32,
    /// Offset of the instruction section.
    pub code_offset: u32,
    /// Offset of the data region (oop table first).
    pub data_offset: u32,
    /// Frame size in words, or 0 for frameless kinds.
    pub frame_size: u32,
}

impl BlobHeader {
    fn new(kind: BlobKind, layout: &BufferLayout, frame_size: u32) -> Self {
        BlobHeader {
            magic: BLOB_MAGIC,
            kind: kind.tag(),
            total_size: layout.total_size as u32,
            reloc_offset: layout.reloc_offset as u32,
            content_offset: layout.content_offset as u32,
            code_offset: layout.insts_offset as u32,
            data_offset: layout.data_offset as u32,
            frame_size,
        }
    }
}

// =============================================================================
// Descriptor
// =============================================================================

/// Everything about a blob that does not come from the emission buffer.
#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    name: String,
    kind: BlobKind,
    frame_size: u32,
    frame_complete_offset: Option<u32>,
    caller_must_gc_arguments: bool,
    oop_maps: Option<OopMapSet>,
    deopt_offsets: Option<DeoptOffsets>,
}

impl BlobDescriptor {
    /// Describe a blob of the given kind.
    pub fn new(name: &str, kind: BlobKind) -> Self {
        BlobDescriptor {
            name: name.to_owned(),
            kind,
            frame_size: 0,
            frame_complete_offset: None,
            caller_must_gc_arguments: false,
            oop_maps: None,
            deopt_offsets: None,
        }
    }

    /// Set the frame size in words.
    pub fn with_frame_size(mut self, words: u32) -> Self {
        debug_assert!(self.kind.has_frame() || words == 0);
        self.frame_size = words;
        self
    }

    /// Set the instruction offset at which the blob's frame is fully built.
    ///
    /// The stack walker must not interpret a frame whose program counter is
    /// below this offset. Leaving it unset marks the frame as never safe to
    /// walk, the right answer for glue code.
    pub fn with_frame_complete_offset(mut self, offset: u32) -> Self {
        self.frame_complete_offset = Some(offset);
        self
    }

    /// Mark the blob as one whose caller keeps oop arguments live across it.
    pub fn with_caller_must_gc_arguments(mut self, flag: bool) -> Self {
        self.caller_must_gc_arguments = flag;
        self
    }

    /// Attach the blob's oop maps.
    pub fn with_oop_maps(mut self, maps: OopMapSet) -> Self {
        self.oop_maps = Some(maps);
        self
    }

    /// Attach deoptimization entry offsets.
    pub fn with_deopt_offsets(mut self, offsets: DeoptOffsets) -> Self {
        self.deopt_offsets = Some(offsets);
        self
    }

    /// The descriptor's blob kind.
    #[inline]
    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    /// The blob name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Heap bytes the blob will occupy when installed from `buffer`.
    ///
    /// Installation fills the block through the same layout computation, so
    /// this is exact, not an estimate.
    pub fn allocation_size(&self, buffer: &CodeBuffer) -> usize {
        buffer.final_layout(BLOB_HEADER_SIZE).total_size
    }
}

// =============================================================================
// CodeBlob
// =============================================================================

/// An installed unit of code, pinned in the code heap.
pub struct CodeBlob {
    name: String,
    kind: BlobKind,
    /// Start of the blob in the heap; the [`BlobHeader`] lives here.
    base: NonNull<u8>,
    layout: BufferLayout,
    frame_size: u32,
    frame_complete_offset: Option<u32>,
    caller_must_gc_arguments: bool,
    oop_maps: Option<OopMapSet>,
    deopt_offsets: Option<DeoptOffsets>,
}

impl CodeBlob {
    /// Fill `base` from the buffer and build the blob value.
    ///
    /// # Safety
    /// `base` must point to at least `len` writable bytes that stay valid
    /// and unmoved for the blob's whole lifetime, with `len` covering the
    /// descriptor's [`BlobDescriptor::allocation_size`] for `buffer`.
    pub(crate) unsafe fn install(
        desc: BlobDescriptor,
        buffer: &CodeBuffer,
        base: NonNull<u8>,
        len: usize,
    ) -> Result<CodeBlob, CopyError> {
        let layout = buffer.final_layout(BLOB_HEADER_SIZE);
        let dest = unsafe { slice::from_raw_parts_mut(base.as_ptr(), len) };
        buffer.copy_to(dest, &layout, base.as_ptr() as usize)?;
        let header = BlobHeader::new(desc.kind, &layout, desc.frame_size);
        unsafe { (base.as_ptr() as *mut BlobHeader).write(header) };
        Ok(CodeBlob {
            name: desc.name,
            kind: desc.kind,
            base,
            layout,
            frame_size: desc.frame_size,
            frame_complete_offset: desc.frame_complete_offset,
            caller_must_gc_arguments: desc.caller_must_gc_arguments,
            oop_maps: desc.oop_maps,
            deopt_offsets: desc.deopt_offsets,
        })
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// The blob's display name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The blob's kind.
    #[inline]
    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    /// Frame size in words; 0 for frameless kinds.
    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Instruction offset at which the frame is fully built, if ever.
    #[inline]
    pub fn frame_complete_offset(&self) -> Option<u32> {
        self.frame_complete_offset
    }

    /// Whether a frame at `pc` is safe for the stack walker to interpret.
    pub fn is_frame_complete_at(&self, pc: *const u8) -> bool {
        if !self.code_contains(pc) {
            return false;
        }
        match self.frame_complete_offset {
            Some(offset) => (pc as usize - self.code_begin() as usize) >= offset as usize,
            None => false,
        }
    }

    /// Whether the caller keeps oop arguments live across calls into this
    /// blob.
    #[inline]
    pub fn caller_must_gc_arguments(&self) -> bool {
        self.caller_must_gc_arguments
    }

    /// Deoptimization entry offsets, if attached.
    #[inline]
    pub fn deopt_offsets(&self) -> Option<&DeoptOffsets> {
        self.deopt_offsets.as_ref()
    }

    /// The in-memory header.
    pub fn header(&self) -> BlobHeader {
        let header = unsafe { (self.base.as_ptr() as *const BlobHeader).read() };
        debug_assert_eq!(header.magic, BLOB_MAGIC);
        header
    }

    // =========================================================================
    // Boundaries
    // =========================================================================

    /// Start of the blob, header included.
    #[inline]
    pub fn begin(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// One past the end of the blob.
    #[inline]
    pub fn end(&self) -> *const u8 {
        unsafe { self.base.as_ptr().add(self.layout.total_size) }
    }

    /// Total blob bytes, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.total_size
    }

    /// First content byte (the consts section).
    #[inline]
    pub fn content_begin(&self) -> *const u8 {
        unsafe { self.base.as_ptr().add(self.layout.content_offset) }
    }

    /// One past the last content byte.
    #[inline]
    pub fn content_end(&self) -> *const u8 {
        unsafe { self.base.as_ptr().add(self.layout.content_end) }
    }

    /// First instruction byte. This is the blob's entry point.
    #[inline]
    pub fn code_begin(&self) -> *const u8 {
        unsafe { self.base.as_ptr().add(self.layout.insts_offset) }
    }

    /// One past the last instruction byte.
    #[inline]
    pub fn code_end(&self) -> *const u8 {
        unsafe {
            self.base
                .as_ptr()
                .add(self.layout.insts_offset + self.layout.sizes.insts)
        }
    }

    /// Start of the data region (oop table first).
    #[inline]
    pub fn data_begin(&self) -> *const u8 {
        unsafe { self.base.as_ptr().add(self.layout.data_offset) }
    }

    /// Whether `pc` falls anywhere inside the blob.
    #[inline]
    pub fn contains(&self, pc: *const u8) -> bool {
        pc >= self.begin() && pc < self.end()
    }

    /// Whether `pc` falls inside the instruction section.
    #[inline]
    pub fn code_contains(&self, pc: *const u8) -> bool {
        pc >= self.code_begin() && pc < self.code_end()
    }

    // =========================================================================
    // Side tables
    // =========================================================================

    /// Iterate the blob's relocations, offsets relative to content begin.
    pub fn relocations(&self) -> RelocIter<'_> {
        let bytes = unsafe {
            slice::from_raw_parts(
                self.base.as_ptr().add(self.layout.reloc_offset),
                self.layout.reloc_size,
            )
        };
        RelocIter::over(bytes)
    }

    /// Number of entries in the oop table.
    #[inline]
    pub fn oop_count(&self) -> usize {
        self.layout.oops_size / WORD_SIZE
    }

    /// The oop table entry at `index`.
    pub fn oop_at(&self, index: usize) -> Option<OopHandle> {
        if index >= self.oop_count() {
            return None;
        }
        let word = unsafe {
            (self.base.as_ptr().add(self.layout.oops_offset) as *const u64)
                .add(index)
                .read()
        };
        Some(OopHandle(u64::from_le(word)))
    }

    /// Number of entries in the metadata table.
    #[inline]
    pub fn metadata_count(&self) -> usize {
        self.layout.metadata_size / WORD_SIZE
    }

    /// The metadata table entry at `index`.
    pub fn metadata_at(&self, index: usize) -> Option<MetadataHandle> {
        if index >= self.metadata_count() {
            return None;
        }
        let word = unsafe {
            (self.base.as_ptr().add(self.layout.metadata_offset) as *const u64)
                .add(index)
                .read()
        };
        Some(MetadataHandle(u64::from_le(word)))
    }

    /// The blob's oop maps, if attached.
    #[inline]
    pub fn oop_maps(&self) -> Option<&OopMapSet> {
        self.oop_maps.as_ref()
    }

    /// The oop map covering a return address inside this blob, if any.
    pub fn oop_map_for_pc(&self, pc: *const u8) -> Option<&OopMap> {
        if !self.code_contains(pc) {
            return None;
        }
        let offset = pc as usize - self.code_begin() as usize;
        self.oop_maps.as_ref()?.find_at(offset as u32)
    }
}

impl fmt::Debug for CodeBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlob")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("size", &self.layout.total_size)
            .finish()
    }
}

// SAFETY: a blob's memory is written once at install and read-only after;
// the cache serializes install and free.
unsafe impl Send for CodeBlob {}
unsafe impl Sync for CodeBlob {}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_codebuf::{RelocKind, SectionKind, CODE_ENTRY_ALIGN};
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// Backing block with the heap's payload alignment.
    struct AlignedBlock {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl AlignedBlock {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, CODE_ENTRY_ALIGN).unwrap();
            let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
            AlignedBlock { ptr, layout }
        }
    }

    impl Drop for AlignedBlock {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    fn sample_buffer() -> CodeBuffer {
        let mut buf = CodeBuffer::with_capacities("sample", 32, 64, 0).unwrap();
        buf.emit_u64(SectionKind::Consts, 0xC0FFEE).unwrap();
        buf.emit_bytes(SectionKind::Insts, &[0x55, 0x48, 0x89, 0xE5]).unwrap();
        buf.emit_u8(SectionKind::Insts, 0xC3).unwrap();
        let oop = buf.oop_recorder_mut().find_oop_index(OopHandle(0xDEAD));
        buf.relocate(SectionKind::Insts, 0, 0, RelocKind::Oop(oop)).unwrap();
        buf
    }

    fn install(desc: BlobDescriptor, buf: &CodeBuffer) -> (CodeBlob, AlignedBlock) {
        let size = desc.allocation_size(buf);
        let block = AlignedBlock::new(size);
        let blob = unsafe { CodeBlob::install(desc, buf, block.ptr, size) }.unwrap();
        (blob, block)
    }

    #[test]
    fn test_header_written_at_base() {
        let buf = sample_buffer();
        let (blob, _block) =
            install(BlobDescriptor::new("stub", BlobKind::RuntimeStub).with_frame_size(4), &buf);

        let header = blob.header();
        assert_eq!(header.magic, BLOB_MAGIC);
        assert_eq!(BlobKind::from_tag(header.kind), Some(BlobKind::RuntimeStub));
        assert_eq!(header.total_size as usize, blob.size());
        assert_eq!(header.frame_size, 4);
        assert_eq!(header.code_offset as usize % CODE_ENTRY_ALIGN, 0);
    }

    #[test]
    fn test_boundaries_nest() {
        let buf = sample_buffer();
        let (blob, _block) = install(BlobDescriptor::new("b", BlobKind::Buffer), &buf);

        assert!(blob.begin() < blob.content_begin());
        assert!(blob.content_begin() <= blob.code_begin());
        assert!(blob.code_begin() < blob.code_end());
        assert!(blob.code_end() <= blob.content_end());
        assert!(blob.content_end() <= blob.data_begin());
        assert!(blob.data_begin() <= blob.end());

        assert!(blob.contains(blob.begin()));
        assert!(blob.code_contains(blob.code_begin()));
        assert!(!blob.contains(blob.end()));
    }

    #[test]
    fn test_code_bytes_installed() {
        let buf = sample_buffer();
        let (blob, _block) = install(BlobDescriptor::new("b", BlobKind::Buffer), &buf);
        let code = unsafe { slice::from_raw_parts(blob.code_begin(), 5) };
        assert_eq!(code, &[0x55, 0x48, 0x89, 0xE5, 0xC3]);
    }

    #[test]
    fn test_relocations_survive_install() {
        let buf = sample_buffer();
        let (blob, _block) = install(BlobDescriptor::new("b", BlobKind::Buffer), &buf);

        let relocs: Vec<_> = blob.relocations().collect();
        assert_eq!(relocs.len(), 1);
        assert!(matches!(relocs[0].kind, RelocKind::Oop(0)));
        // Offset is content-relative: the insts section follows the consts.
        let header = blob.header();
        assert_eq!(
            relocs[0].offset,
            header.code_offset - header.content_offset
        );
    }

    #[test]
    fn test_oop_table_lookup() {
        let buf = sample_buffer();
        let (blob, _block) = install(BlobDescriptor::new("b", BlobKind::Buffer), &buf);
        assert_eq!(blob.oop_count(), 1);
        assert_eq!(blob.oop_at(0), Some(OopHandle(0xDEAD)));
        assert_eq!(blob.oop_at(1), None);
        assert_eq!(blob.metadata_count(), 0);
    }

    #[test]
    fn test_oop_map_for_pc() {
        let buf = sample_buffer();
        let mut maps = OopMapSet::new();
        maps.add(OopMap::new(4).with_oop(1));
        let (blob, _block) = install(
            BlobDescriptor::new("m", BlobKind::Method).with_oop_maps(maps),
            &buf,
        );

        let ret = unsafe { blob.code_begin().add(4) };
        assert_eq!(blob.oop_map_for_pc(ret).unwrap().slots(), &[1]);
        assert!(blob.oop_map_for_pc(blob.code_begin()).is_none());
        assert!(blob.oop_map_for_pc(blob.end()).is_none());
    }

    #[test]
    fn test_frame_complete_gates_stack_walking() {
        let buf = sample_buffer();
        let (blob, _block) = install(
            BlobDescriptor::new("stub", BlobKind::RuntimeStub)
                .with_frame_size(4)
                .with_frame_complete_offset(2)
                .with_caller_must_gc_arguments(true),
            &buf,
        );

        assert_eq!(blob.frame_complete_offset(), Some(2));
        assert!(blob.caller_must_gc_arguments());
        // Below the completion offset the frame is still being built.
        assert!(!blob.is_frame_complete_at(blob.code_begin()));
        assert!(blob.is_frame_complete_at(unsafe { blob.code_begin().add(2) }));
        assert!(!blob.is_frame_complete_at(blob.end()));

        // No completion offset means the frame is never walkable.
        let (glue, _block2) = install(BlobDescriptor::new("glue", BlobKind::Buffer), &buf);
        assert_eq!(glue.frame_complete_offset(), None);
        assert!(!glue.is_frame_complete_at(unsafe { glue.code_begin().add(2) }));
    }

    #[test]
    fn test_kind_tags_round_trip() {
        for kind in BlobKind::ALL {
            assert_eq!(BlobKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(BlobKind::from_tag(99), None);
        assert!(BlobKind::Method.is_method());
        assert!(BlobKind::RuntimeStub.has_frame());
        assert!(!BlobKind::Buffer.has_frame());
    }
}
