//! Segment-granularity heap for generated code.
//!
//! The heap carves one reserved [`VirtualRegion`] into fixed-size segments
//! and hands out blocks that each occupy a whole number of segments. Every
//! block starts with an in-place [`BlockHeader`]; the payload follows at a
//! fixed offset so all payloads share the code entry alignment.
//!
//! # Memory Layout
//! ```text
//! segment:   0        1        2        3        4        5
//!          +--------+--------+--------+--------+--------+--------+
//!          | hdr|A.......... | hdr|B..| hdr|free......  | virgin |
//!          +--------+--------+--------+--------+--------+--------+
//! segmap:    0   1       2     0        0   1      2      0xFF
//! ```
//! The segment map holds one byte per segment: `0xFF` for segments not
//! owned by any block chain, `0` for a block's first segment, and otherwise
//! a backward hop distance. Chains cap hops at `0xFE`, so resolving an
//! interior pointer is a short walk of backward hops ending at the header.
//!
//! Frees leave merged blocks' interior map bytes stale rather than rewriting
//! them; lookups stay correct because stale chains can only land on a free
//! or non-covering header, and [`CodeHeap::defrag_segmap`] sweeps the
//! staleness away once enough of it accumulates.

use std::fmt;
use std::ptr::NonNull;

use crate::config::{ConfigError, HeapConfig};
use crate::stats::HeapStats;
use crate::virtualmem::{RegionError, VirtualRegion};

/// Segment-map byte for segments outside any live hop chain.
const FREE_SENTINEL: u8 = 0xFF;

/// Largest backward hop a single segment-map byte can encode.
const MAX_HOP: u8 = 0xFE;

/// End-of-list marker for the intrusive free list.
const FREE_LIST_END: u32 = u32::MAX;

/// Bytes between a block's start and its payload.
///
/// Holds the [`BlockHeader`] plus padding so payloads land on the code
/// entry alignment whenever the segment size is a multiple of this.
pub const BLOCK_OVERHEAD: usize = 32;

#[inline]
const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from constructing a code heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The configuration failed validation.
    Config(ConfigError),
    /// The backing virtual memory could not be set up.
    Region(RegionError),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::Config(e) => write!(f, "Invalid heap configuration: {}", e),
            HeapError::Region(e) => write!(f, "Heap memory setup failed: {}", e),
        }
    }
}

impl std::error::Error for HeapError {}

impl From<ConfigError> for HeapError {
    fn from(e: ConfigError) -> Self {
        HeapError::Config(e)
    }
}

impl From<RegionError> for HeapError {
    fn from(e: RegionError) -> Self {
        HeapError::Region(e)
    }
}

// =============================================================================
// Block header
// =============================================================================

/// Header written in place at the start of every block.
///
/// Lives inside the heap's own memory, so it must stay 16 bytes and
/// field-order stable.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    /// Block length in segments, header included.
    length: u32,
    /// 1 for live blocks, 0 for free blocks.
    used: u32,
    /// Segment index of the next free block; `FREE_LIST_END` when used or
    /// last on the list.
    next_free: u32,
    _reserved: u32,
}

// =============================================================================
// Block iteration
// =============================================================================

/// A block observed while walking the heap.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    /// Payload start.
    pub payload: NonNull<u8>,
    /// Payload bytes (block bytes minus overhead).
    pub payload_size: usize,
    /// Whether the block is live.
    pub used: bool,
}

/// Iterator over every block in the heap, in address order.
pub struct HeapBlocks<'a> {
    heap: &'a CodeHeap,
    seg: usize,
}

impl<'a> Iterator for HeapBlocks<'a> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.seg >= self.heap.next_segment {
            return None;
        }
        let header = unsafe { self.heap.read_header(self.seg) };
        let info = BlockInfo {
            payload: self.heap.payload_ptr(self.seg),
            payload_size: ((header.length as usize) << self.heap.log2_segment_size)
                - BLOCK_OVERHEAD,
            used: header.used != 0,
        };
        self.seg += header.length as usize;
        Some(info)
    }
}

// =============================================================================
// CodeHeap
// =============================================================================

/// A code heap over one reserved region.
///
/// Not internally synchronized: the owner serializes access, so all
/// mutating operations take `&mut self`.
pub struct CodeHeap {
    name: String,
    config: HeapConfig,
    region: VirtualRegion,
    log2_segment_size: u32,
    /// One byte per reserved segment.
    segmap: Vec<u8>,
    /// Total segments in the reservation.
    total_segments: usize,
    /// Virgin-space frontier in segments. Everything below is covered by
    /// block headers.
    next_segment: usize,
    /// Head of the address-ordered intrusive free list.
    free_head: u32,
    /// Segment of the most recently placed block, while it is still live.
    last_allocated: Option<u32>,
    freelist_length: usize,
    freelist_segments: usize,
    allocated_bytes: usize,
    max_allocated_bytes: usize,
    blob_count: usize,
    full_count: usize,
    stale_segmap_bytes: usize,
}

impl CodeHeap {
    /// Create a heap, reserving its address space up front.
    pub fn new(name: &str, config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let region = VirtualRegion::reserve(config.reserved_size)?;
        let log2_segment_size = config.segment_size.trailing_zeros();
        let total_segments = region.reserved() >> log2_segment_size;
        Ok(CodeHeap {
            name: name.to_owned(),
            segmap: vec![FREE_SENTINEL; total_segments],
            region,
            log2_segment_size,
            total_segments,
            next_segment: 0,
            free_head: FREE_LIST_END,
            last_allocated: None,
            freelist_length: 0,
            freelist_segments: 0,
            allocated_bytes: 0,
            max_allocated_bytes: 0,
            blob_count: 0,
            full_count: 0,
            stale_segmap_bytes: 0,
            config,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The heap's display name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocation granularity in bytes.
    #[inline]
    pub fn segment_size(&self) -> usize {
        1 << self.log2_segment_size
    }

    /// Lowest address of the reservation.
    #[inline]
    pub fn low_boundary(&self) -> *const u8 {
        self.region.base().as_ptr()
    }

    /// One past the highest address of the reservation.
    #[inline]
    pub fn high_boundary(&self) -> *const u8 {
        unsafe { self.region.base().as_ptr().add(self.region.reserved()) }
    }

    /// Whether `addr` falls inside the reservation.
    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        self.region.contains(addr as usize)
    }

    /// Number of live blocks.
    #[inline]
    pub fn blob_count(&self) -> usize {
        self.blob_count
    }

    /// Allocation requests refused for lack of space.
    #[inline]
    pub fn full_count(&self) -> usize {
        self.full_count
    }

    /// Number of blocks on the free list.
    #[inline]
    pub fn freelist_length(&self) -> usize {
        self.freelist_length
    }

    /// Bytes of the largest free block, overhead included.
    pub fn largest_free_block(&self) -> usize {
        let mut largest = 0u32;
        let mut cur = self.free_head;
        while cur != FREE_LIST_END {
            let header = unsafe { self.read_header(cur as usize) };
            largest = largest.max(header.length);
            cur = header.next_free;
        }
        (largest as usize) << self.log2_segment_size
    }

    /// Bytes held by live blocks, headers included.
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Segments a payload of `size` bytes occupies, overhead included.
    #[inline]
    pub fn segments_for(&self, size: usize) -> usize {
        align_up(size + BLOCK_OVERHEAD, self.segment_size()) >> self.log2_segment_size
    }

    /// Snapshot of the heap's accounting counters.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            reserved_bytes: self.region.reserved(),
            committed_bytes: self.region.committed(),
            allocated_bytes: self.allocated_bytes,
            max_allocated_bytes: self.max_allocated_bytes,
            freelist_bytes: self.freelist_segments << self.log2_segment_size,
            freelist_length: self.freelist_length,
            blob_count: self.blob_count,
            full_count: self.full_count,
            stale_segmap_bytes: self.stale_segmap_bytes,
        }
    }

    /// Walk every block in address order.
    pub fn blocks(&self) -> HeapBlocks<'_> {
        HeapBlocks { heap: self, seg: 0 }
    }

    /// Flip every committed page to read-execute.
    ///
    /// Installation and bookkeeping both write into committed memory, so
    /// call [`CodeHeap::mark_writable`] before any further mutation.
    pub fn mark_executable(&mut self) -> Result<(), RegionError> {
        let committed = self.region.committed();
        if committed == 0 {
            return Ok(());
        }
        self.region.mark_executable(0, committed)
    }

    /// Flip every committed page back to read-write.
    pub fn mark_writable(&mut self) -> Result<(), RegionError> {
        let committed = self.region.committed();
        if committed == 0 {
            return Ok(());
        }
        self.region.mark_writable(0, committed)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a block with at least `size` payload bytes.
    ///
    /// Returns the payload pointer, aligned to [`BLOCK_OVERHEAD`] past a
    /// segment boundary. `None` when the request cannot be satisfied; the
    /// heap is unchanged in that case apart from its full counter.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let need = self.segments_for(size);

        if let Some(seg) = self.search_freelist(need) {
            return Some(self.place_block(seg, need));
        }

        // Carve from virgin space, committing pages up to the new frontier.
        let end = self.next_segment + need;
        if end > self.total_segments {
            self.full_count += 1;
            return None;
        }
        let needed_bytes = end << self.log2_segment_size;
        if needed_bytes > self.region.committed() {
            let target = align_up(needed_bytes, self.config.commit_increment)
                .min(self.region.reserved())
                .max(needed_bytes);
            if self.region.commit_to(target).is_err() {
                self.full_count += 1;
                return None;
            }
        }
        let seg = self.next_segment;
        self.next_segment = end;
        Some(self.place_block(seg, need))
    }

    /// Find a free block of at least `need` segments, unlinking or splitting
    /// it. First fit in address order.
    fn search_freelist(&mut self, need: usize) -> Option<usize> {
        let mut prev: Option<u32> = None;
        let mut cur = self.free_head;
        while cur != FREE_LIST_END {
            let header = unsafe { self.read_header(cur as usize) };
            let length = header.length as usize;
            if length >= need {
                let follower = if length > need {
                    // Keep the tail on the list as a smaller free block.
                    self.split_block(cur, need as u32)
                } else {
                    self.freelist_length -= 1;
                    header.next_free
                };
                match prev {
                    Some(p) => unsafe {
                        let mut ph = self.read_header(p as usize);
                        ph.next_free = follower;
                        self.write_header(p as usize, ph);
                    },
                    None => self.free_head = follower,
                }
                self.freelist_segments -= need;
                return Some(cur as usize);
            }
            prev = Some(cur);
            cur = header.next_free;
        }
        None
    }

    /// Split a free block at `split_at` segments, producing two free blocks.
    ///
    /// The remainder inherits the original's list link; the caller fixes up
    /// whichever link pointed at `seg`. Returns the remainder's segment.
    fn split_block(&mut self, seg: u32, split_at: u32) -> u32 {
        let header = unsafe { self.read_header(seg as usize) };
        debug_assert_eq!(header.used, 0, "split of a live block");
        debug_assert!(split_at > 0 && split_at < header.length);

        let rem_seg = seg + split_at;
        unsafe {
            self.write_header(
                rem_seg as usize,
                BlockHeader {
                    length: header.length - split_at,
                    used: 0,
                    next_free: header.next_free,
                    _reserved: 0,
                },
            );
        }
        self.segmap[rem_seg as usize] = FREE_SENTINEL;
        rem_seg
    }

    /// Write a live header and a fresh hop chain over `[seg, seg + need)`.
    fn place_block(&mut self, seg: usize, need: usize) -> NonNull<u8> {
        unsafe {
            self.write_header(
                seg,
                BlockHeader {
                    length: need as u32,
                    used: 1,
                    next_free: FREE_LIST_END,
                    _reserved: 0,
                },
            );
        }
        self.mark_segmap_used(seg, need);

        self.allocated_bytes += need << self.log2_segment_size;
        self.max_allocated_bytes = self.max_allocated_bytes.max(self.allocated_bytes);
        self.blob_count += 1;
        self.last_allocated = Some(seg as u32);
        self.payload_ptr(seg)
    }

    // =========================================================================
    // Deallocation
    // =========================================================================

    /// Return a block to the free list.
    ///
    /// Adjacent free neighbors are merged immediately; the merged blocks'
    /// interior segment-map bytes are left stale until the next sweep.
    ///
    /// # Safety
    /// `payload` must have come from [`CodeHeap::allocate`] on this heap and
    /// not been freed since; no references into the block may outlive the
    /// call.
    pub unsafe fn deallocate(&mut self, payload: NonNull<u8>) {
        let seg = self.payload_segment(payload);
        let header = unsafe { self.read_header(seg) };
        debug_assert_eq!(header.used, 1, "double free or bad pointer");
        debug_assert_eq!(self.segmap[seg], 0);

        let length = header.length as usize;
        self.allocated_bytes -= length << self.log2_segment_size;
        self.blob_count -= 1;
        if self.last_allocated == Some(seg as u32) {
            self.last_allocated = None;
        }
        self.add_to_freelist(seg as u32, length as u32);
        self.maybe_defrag();
    }

    /// Shrink a live block in place, freeing its unused tail.
    ///
    /// The block keeps at least `used_size` payload bytes; whole trailing
    /// segments beyond that go back to the free list. A no-op when nothing
    /// can be trimmed. Only the most recent allocation may be trimmed.
    ///
    /// # Safety
    /// Same contract as [`CodeHeap::deallocate`], except the block stays
    /// live; no references into the trimmed tail may outlive the call.
    pub unsafe fn deallocate_tail(&mut self, payload: NonNull<u8>, used_size: usize) {
        let seg = self.payload_segment(payload);
        let mut header = unsafe { self.read_header(seg) };
        debug_assert_eq!(header.used, 1, "trim of a free block");
        debug_assert_eq!(
            self.last_allocated,
            Some(seg as u32),
            "trim of a block that is not the latest allocation"
        );

        let length = header.length as usize;
        let keep = self.segments_for(used_size.max(1));
        if keep >= length {
            return;
        }
        let tail = length - keep;
        header.length = keep as u32;
        unsafe { self.write_header(seg, header) };
        self.allocated_bytes -= tail << self.log2_segment_size;
        self.add_to_freelist((seg + keep) as u32, tail as u32);
        self.maybe_defrag();
    }

    /// Insert `[seg, seg + len)` into the address-ordered free list, merging
    /// with adjacent free blocks.
    fn add_to_freelist(&mut self, seg: u32, len: u32) {
        self.freelist_segments += len as usize;

        let mut prev: Option<u32> = None;
        let mut cur = self.free_head;
        while cur != FREE_LIST_END && cur < seg {
            prev = Some(cur);
            cur = unsafe { self.read_header(cur as usize).next_free };
        }

        // Absorb into the preceding block when contiguous. The absorbed
        // block's header byte must stop looking like a live block start, or
        // lookups into it would resolve to freed memory.
        if let Some(p) = prev {
            let mut ph = unsafe { self.read_header(p as usize) };
            if p + ph.length == seg {
                let mut absorbed = unsafe { self.read_header(seg as usize) };
                absorbed.used = 0;
                unsafe { self.write_header(seg as usize, absorbed) };
                self.segmap[seg as usize] = FREE_SENTINEL;
                ph.length += len;
                unsafe { self.write_header(p as usize, ph) };
                self.stale_segmap_bytes += len as usize - 1;
                self.merge_right(p);
                return;
            }
        }

        unsafe {
            self.write_header(
                seg as usize,
                BlockHeader {
                    length: len,
                    used: 0,
                    next_free: cur,
                    _reserved: 0,
                },
            );
        }
        self.segmap[seg as usize] = FREE_SENTINEL;
        self.stale_segmap_bytes += len as usize - 1;
        match prev {
            Some(p) => unsafe {
                let mut ph = self.read_header(p as usize);
                ph.next_free = seg;
                self.write_header(p as usize, ph);
            },
            None => self.free_head = seg,
        }
        self.freelist_length += 1;
        self.merge_right(seg);
    }

    /// Merge `seg` with its list successor if the two are contiguous.
    fn merge_right(&mut self, seg: u32) {
        let mut header = unsafe { self.read_header(seg as usize) };
        let next = header.next_free;
        if next != FREE_LIST_END && seg + header.length == next {
            let next_header = unsafe { self.read_header(next as usize) };
            header.length += next_header.length;
            header.next_free = next_header.next_free;
            unsafe { self.write_header(seg as usize, header) };
            self.freelist_length -= 1;
            self.stale_segmap_bytes += next_header.length as usize;
        }
    }

    // =========================================================================
    // Segment map
    // =========================================================================

    /// Resolve an interior pointer to the payload start of the live block
    /// containing it.
    ///
    /// Returns `None` for pointers into free space, virgin space, or outside
    /// the heap.
    pub fn find_start(&self, addr: *const u8) -> Option<NonNull<u8>> {
        let addr = addr as usize;
        let base = self.region.base().as_ptr() as usize;
        let frontier = base + (self.next_segment << self.log2_segment_size);
        if addr < base || addr >= frontier {
            return None;
        }

        let mut seg = (addr - base) >> self.log2_segment_size;
        loop {
            let hop = self.segmap[seg];
            if hop == FREE_SENTINEL {
                return None;
            }
            if hop == 0 {
                break;
            }
            let hop = hop as usize;
            if hop > seg {
                return None;
            }
            seg -= hop;
        }

        let header = unsafe { self.read_header(seg) };
        if header.used == 0 {
            return None;
        }
        // A stale chain can land on a header that does not cover the query.
        let start = base + (seg << self.log2_segment_size);
        let end = start + ((header.length as usize) << self.log2_segment_size);
        if addr < start || addr >= end {
            return None;
        }
        Some(self.payload_ptr(seg))
    }

    /// Rewrite the segment map of every free block to the free sentinel,
    /// clearing accumulated staleness.
    pub fn defrag_segmap(&mut self) {
        let mut cur = self.free_head;
        while cur != FREE_LIST_END {
            let header = unsafe { self.read_header(cur as usize) };
            let seg = cur as usize;
            self.segmap[seg..seg + header.length as usize].fill(FREE_SENTINEL);
            cur = header.next_free;
        }
        self.stale_segmap_bytes = 0;
    }

    fn maybe_defrag(&mut self) {
        if self.stale_segmap_bytes > self.config.fragmentation_limit {
            self.defrag_segmap();
        }
    }

    fn mark_segmap_used(&mut self, seg: usize, len: usize) {
        self.segmap[seg] = 0;
        for i in 1..len {
            self.segmap[seg + i] = (i.min(MAX_HOP as usize)) as u8;
        }
    }

    // =========================================================================
    // Raw access
    // =========================================================================

    #[inline]
    fn header_ptr(&self, seg: usize) -> *mut BlockHeader {
        debug_assert!(seg < self.total_segments);
        unsafe {
            self.region
                .base()
                .as_ptr()
                .add(seg << self.log2_segment_size) as *mut BlockHeader
        }
    }

    /// # Safety
    /// The segment must start a block whose header memory is committed.
    unsafe fn read_header(&self, seg: usize) -> BlockHeader {
        unsafe { self.header_ptr(seg).read() }
    }

    /// # Safety
    /// Same as [`CodeHeap::read_header`].
    unsafe fn write_header(&self, seg: usize, header: BlockHeader) {
        unsafe { self.header_ptr(seg).write(header) }
    }

    #[inline]
    fn payload_ptr(&self, seg: usize) -> NonNull<u8> {
        unsafe {
            NonNull::new_unchecked(
                self.region
                    .base()
                    .as_ptr()
                    .add((seg << self.log2_segment_size) + BLOCK_OVERHEAD),
            )
        }
    }

    /// Segment index of the block whose payload starts at `payload`.
    fn payload_segment(&self, payload: NonNull<u8>) -> usize {
        let addr = payload.as_ptr() as usize - BLOCK_OVERHEAD;
        let base = self.region.base().as_ptr() as usize;
        debug_assert!(addr >= base && addr < base + self.region.reserved());
        debug_assert!((addr - base) & (self.segment_size() - 1) == 0);
        (addr - base) >> self.log2_segment_size
    }
}

impl fmt::Debug for CodeHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeHeap")
            .field("name", &self.name)
            .field("segment_size", &self.segment_size())
            .field("reserved", &self.region.reserved())
            .field("committed", &self.region.committed())
            .field("allocated_bytes", &self.allocated_bytes)
            .field("blob_count", &self.blob_count)
            .field("freelist_length", &self.freelist_length)
            .finish()
    }
}
