//! Point-in-time accounting snapshots for a code heap.

/// A snapshot of a [`CodeHeap`](crate::CodeHeap)'s accounting counters.
///
/// Taken under whatever lock the owner uses to serialize heap access, so
/// all fields are mutually consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total reserved address space in bytes.
    pub reserved_bytes: usize,
    /// Committed bytes from the base.
    pub committed_bytes: usize,
    /// Bytes held by live blocks, headers included.
    pub allocated_bytes: usize,
    /// High-water mark of `allocated_bytes`.
    pub max_allocated_bytes: usize,
    /// Bytes sitting on the free list.
    pub freelist_bytes: usize,
    /// Number of blocks on the free list.
    pub freelist_length: usize,
    /// Number of live blocks.
    pub blob_count: usize,
    /// Allocation requests refused because the heap was exhausted.
    pub full_count: usize,
    /// Segment-map bytes left stale by frees and merges.
    pub stale_segmap_bytes: usize,
}

impl HeapStats {
    /// Bytes neither live nor on the free list (virgin space).
    #[inline]
    pub fn virgin_bytes(&self) -> usize {
        self.reserved_bytes
            .saturating_sub(self.allocated_bytes)
            .saturating_sub(self.freelist_bytes)
    }

    /// Fraction of reserved space held by live blocks, in `[0.0, 1.0]`.
    #[inline]
    pub fn utilization(&self) -> f64 {
        if self.reserved_bytes == 0 {
            return 0.0;
        }
        self.allocated_bytes as f64 / self.reserved_bytes as f64
    }
}
