//! The code cache: one lock, a heap per code category, one blob registry.
//!
//! Compiled methods and glue code (stubs, adapters, buffers) live in
//! separate [`CodeHeap`]s so each category packs against its own kind. All
//! mutation of the heaps and of the address-ordered blob registry happens
//! under a single [`Mutex`], so heap bookkeeping and registry contents can
//! never disagree. Lookups by program counter take the same lock briefly
//! and hand back an [`Arc`] so callers inspect blobs without holding it.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use basalt_codebuf::{CodeBuffer, CopyError};
use basalt_codeheap::{CodeHeap, HeapConfig, HeapError, HeapStats};

use crate::blob::{BlobDescriptor, BlobKind, CodeBlob};
use crate::stats::CacheStats;

// =============================================================================
// Heap categories
// =============================================================================

/// Which of the cache's heaps a blob lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapCategory {
    /// Stubs, adapters, and other glue code.
    NonMethod = 0,
    /// Compiled managed methods.
    Method = 1,
}

impl HeapCategory {
    /// All categories, in heap order.
    pub const ALL: [HeapCategory; 2] = [HeapCategory::NonMethod, HeapCategory::Method];

    /// The category a blob kind belongs to.
    #[inline]
    pub fn of(kind: BlobKind) -> HeapCategory {
        if kind.is_method() {
            HeapCategory::Method
        } else {
            HeapCategory::NonMethod
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    /// Display name of the category's heap.
    pub const fn heap_name(self) -> &'static str {
        match self {
            HeapCategory::NonMethod => "non-method code heap",
            HeapCategory::Method => "method code heap",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// What the cache does when the heap cannot satisfy an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Report the failure immediately.
    Fail,
    /// Sweep the heap's segment map and retry once before reporting.
    SweepAndRetry,
}

/// Configuration for a [`CodeCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Configuration for the heap holding glue code.
    pub non_method_heap: HeapConfig,
    /// Configuration for the heap holding compiled methods.
    pub method_heap: HeapConfig,
    /// Allocation-failure policy.
    pub alloc_policy: AllocPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            non_method_heap: HeapConfig::default(),
            method_heap: HeapConfig::default(),
            alloc_policy: AllocPolicy::SweepAndRetry,
        }
    }
}

impl CacheConfig {
    /// The heap configuration for a category.
    fn heap_config(&self, category: HeapCategory) -> &HeapConfig {
        match category {
            HeapCategory::NonMethod => &self.non_method_heap,
            HeapCategory::Method => &self.method_heap,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// Constructing or growing the backing heap failed.
    Heap(HeapError),
    /// Filling a freshly allocated block failed.
    Copy(CopyError),
    /// The heap has no room for the blob.
    Full {
        /// Bytes the blob needed.
        requested: usize,
    },
    /// The blob is not registered with this cache.
    UnknownBlob,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Heap(e) => write!(f, "Code heap error: {}", e),
            CacheError::Copy(e) => write!(f, "Blob installation failed: {}", e),
            CacheError::Full { requested } => {
                write!(f, "Code cache full: no room for {} bytes", requested)
            }
            CacheError::UnknownBlob => write!(f, "Blob is not registered with this cache"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<HeapError> for CacheError {
    fn from(e: HeapError) -> Self {
        CacheError::Heap(e)
    }
}

impl From<CopyError> for CacheError {
    fn from(e: CopyError) -> Self {
        CacheError::Copy(e)
    }
}

// =============================================================================
// CodeCache
// =============================================================================

/// Heaps plus registry, guarded by the cache lock.
struct CacheInner {
    /// One heap per [`HeapCategory`], indexed by category.
    heaps: [CodeHeap; 2],
    /// Installed blobs keyed by base address, across all heaps.
    registry: BTreeMap<usize, Arc<CodeBlob>>,
}

/// The cache of installed code blobs.
pub struct CodeCache {
    inner: Mutex<CacheInner>,
    alloc_policy: AllocPolicy,
    stats: CacheStats,
}

impl CodeCache {
    /// Create a cache, reserving one heap per category.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let non_method = CodeHeap::new(
            HeapCategory::NonMethod.heap_name(),
            config.heap_config(HeapCategory::NonMethod).clone(),
        )?;
        let method = CodeHeap::new(
            HeapCategory::Method.heap_name(),
            config.heap_config(HeapCategory::Method).clone(),
        )?;
        Ok(CodeCache {
            inner: Mutex::new(CacheInner {
                heaps: [non_method, method],
                registry: BTreeMap::new(),
            }),
            alloc_policy: config.alloc_policy,
            stats: CacheStats::new(),
        })
    }

    /// Create a cache with default configuration.
    pub fn with_default_config() -> Result<Self, CacheError> {
        Self::new(CacheConfig::default())
    }

    // =========================================================================
    // Installation
    // =========================================================================

    /// Size a blob from the finished buffer, allocate its block, and fill it.
    ///
    /// The returned blob is registered for [`CodeCache::find_blob`] lookups
    /// and stays pinned until freed.
    pub fn allocate_blob(
        &self,
        desc: BlobDescriptor,
        buffer: &CodeBuffer,
    ) -> Result<Arc<CodeBlob>, CacheError> {
        let size = desc.allocation_size(buffer);
        let kind = desc.kind();
        let idx = HeapCategory::of(kind).index();
        let mut inner = self.inner.lock();

        let payload = match inner.heaps[idx].allocate(size) {
            Some(p) => p,
            None => {
                let retried = match self.alloc_policy {
                    AllocPolicy::Fail => None,
                    AllocPolicy::SweepAndRetry => {
                        inner.heaps[idx].defrag_segmap();
                        inner.heaps[idx].allocate(size)
                    }
                };
                match retried {
                    Some(p) => p,
                    None => {
                        self.stats.record_failure();
                        return Err(CacheError::Full { requested: size });
                    }
                }
            }
        };

        // The block is exclusively ours until it lands in the registry.
        let blob = match unsafe { CodeBlob::install(desc, buffer, payload, size) } {
            Ok(blob) => Arc::new(blob),
            Err(e) => {
                unsafe { inner.heaps[idx].deallocate(payload) };
                return Err(e.into());
            }
        };

        inner.registry.insert(payload.as_ptr() as usize, blob.clone());
        self.stats.record_install(size, kind);
        Ok(blob)
    }

    /// Remove a blob and return its block to the heap.
    ///
    /// # Safety
    /// No thread may be executing in the blob or holding pointers into its
    /// memory. Outstanding [`Arc`] handles stay valid as values, but their
    /// accessors must not be used to read blob memory after this call.
    pub unsafe fn free_blob(&self, blob: &Arc<CodeBlob>) -> Result<(), CacheError> {
        let base = blob.base();
        let idx = HeapCategory::of(blob.kind()).index();
        let mut inner = self.inner.lock();
        if inner.registry.remove(&(base.as_ptr() as usize)).is_none() {
            return Err(CacheError::UnknownBlob);
        }
        unsafe { inner.heaps[idx].deallocate(base) };
        self.stats.record_free(blob.size(), blob.kind());
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// The registered blob containing `pc`, if any.
    pub fn find_blob(&self, pc: *const u8) -> Option<Arc<CodeBlob>> {
        let inner = self.inner.lock();
        let (_, blob) = inner.registry.range(..=pc as usize).next_back()?;
        if blob.contains(pc) {
            Some(blob.clone())
        } else {
            None
        }
    }

    /// Whether `pc` falls inside a registered blob.
    pub fn contains(&self, pc: *const u8) -> bool {
        self.find_blob(pc).is_some()
    }

    /// Resolve `pc` to its heap block's payload start via the segment map.
    ///
    /// Unlike [`CodeCache::find_blob`] this answers from heap bookkeeping
    /// alone, so it also covers blocks allocated around the registry.
    pub fn find_start(&self, pc: *const u8) -> Option<NonNull<u8>> {
        let inner = self.inner.lock();
        inner.heaps.iter().find_map(|heap| heap.find_start(pc))
    }

    /// Snapshot of every registered blob, in address order.
    pub fn blobs(&self) -> Vec<Arc<CodeBlob>> {
        self.inner.lock().registry.values().cloned().collect()
    }

    /// Number of registered blobs.
    pub fn blob_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Sweep every heap's segment map, clearing accumulated staleness.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock();
        for heap in &mut inner.heaps {
            heap.defrag_segmap();
        }
    }

    /// Flip every heap's committed pages to read-execute.
    ///
    /// No installs or frees may run until [`CodeCache::make_writable`];
    /// they would fault on the protected bookkeeping words.
    pub fn make_executable(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        for heap in &mut inner.heaps {
            heap.mark_executable()
                .map_err(|e| CacheError::Heap(HeapError::Region(e)))?;
        }
        Ok(())
    }

    /// Flip every heap's committed pages back to read-write.
    pub fn make_writable(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        for heap in &mut inner.heaps {
            heap.mark_writable()
                .map_err(|e| CacheError::Heap(HeapError::Region(e)))?;
        }
        Ok(())
    }

    /// The cache's counters.
    #[inline]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Snapshot of one heap's accounting.
    pub fn heap_stats(&self, category: HeapCategory) -> HeapStats {
        self.inner.lock().heaps[category.index()].stats()
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CodeCache")
            .field("blobs", &inner.registry.len())
            .field("heaps", &inner.heaps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobKind;
    use basalt_codebuf::SectionKind;

    fn small_heap_config() -> HeapConfig {
        HeapConfig {
            reserved_size: 4096,
            segment_size: 128,
            commit_increment: 4096,
            ..Default::default()
        }
    }

    fn small_cache(policy: AllocPolicy) -> CodeCache {
        CodeCache::new(CacheConfig {
            non_method_heap: small_heap_config(),
            method_heap: small_heap_config(),
            alloc_policy: policy,
        })
        .unwrap()
    }

    fn stub_buffer(code: &[u8]) -> CodeBuffer {
        let mut buf = CodeBuffer::new("stub", 256).unwrap();
        buf.emit_bytes(SectionKind::Insts, code).unwrap();
        buf
    }

    #[test]
    fn test_allocate_registers_blob() {
        let cache = small_cache(AllocPolicy::Fail);
        let buf = stub_buffer(&[0xC3]);
        let blob = cache
            .allocate_blob(BlobDescriptor::new("ret", BlobKind::RuntimeStub), &buf)
            .unwrap();

        assert_eq!(cache.blob_count(), 1);
        assert_eq!(cache.stats().installs(), 1);
        assert_eq!(cache.stats().bytes_installed(), blob.size());

        let found = cache.find_blob(blob.code_begin()).unwrap();
        assert!(Arc::ptr_eq(&found, &blob));
        assert!(cache.contains(blob.begin()));
        assert!(!cache.contains(blob.end()));
    }

    #[test]
    fn test_find_blob_between_blobs() {
        let cache = small_cache(AllocPolicy::Fail);
        let buf = stub_buffer(&[0x90; 8]);
        let a = cache
            .allocate_blob(BlobDescriptor::new("a", BlobKind::Buffer), &buf)
            .unwrap();
        let b = cache
            .allocate_blob(BlobDescriptor::new("b", BlobKind::Buffer), &buf)
            .unwrap();

        let inner_a = unsafe { a.begin().add(a.size() / 2) };
        assert!(Arc::ptr_eq(&cache.find_blob(inner_a).unwrap(), &a));

        unsafe { cache.free_blob(&a).unwrap() };
        assert!(cache.find_blob(inner_a).is_none());
        assert!(cache.find_blob(b.code_begin()).is_some());
    }

    #[test]
    fn test_free_blob_returns_space() {
        let cache = small_cache(AllocPolicy::Fail);
        let buf = stub_buffer(&[0xC3]);
        let blob = cache
            .allocate_blob(BlobDescriptor::new("ret", BlobKind::Buffer), &buf)
            .unwrap();
        let allocated = cache.heap_stats(HeapCategory::NonMethod).allocated_bytes;

        unsafe { cache.free_blob(&blob).unwrap() };
        assert_eq!(cache.blob_count(), 0);
        assert_eq!(cache.stats().bytes_installed(), 0);
        assert!(cache.heap_stats(HeapCategory::NonMethod).allocated_bytes < allocated);

        // Double free is an error, not a heap corruption.
        assert_eq!(
            unsafe { cache.free_blob(&blob) },
            Err(CacheError::UnknownBlob)
        );
    }

    #[test]
    fn test_full_cache_reports_error() {
        let cache = small_cache(AllocPolicy::SweepAndRetry);
        let buf = stub_buffer(&[0x90; 64]);
        let mut installed = 0;
        loop {
            match cache.allocate_blob(BlobDescriptor::new("fill", BlobKind::Buffer), &buf) {
                Ok(_) => installed += 1,
                Err(CacheError::Full { requested }) => {
                    assert!(requested > 0);
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(installed > 0);
        assert_eq!(cache.stats().failures(), 1);
        // The retry path touches the heap twice per refused request.
        assert_eq!(cache.heap_stats(HeapCategory::NonMethod).full_count, 2);
    }

    #[test]
    fn test_find_start_reaches_heap_bookkeeping() {
        let cache = small_cache(AllocPolicy::Fail);
        let buf = stub_buffer(&[0xC3]);
        let blob = cache
            .allocate_blob(BlobDescriptor::new("ret", BlobKind::Buffer), &buf)
            .unwrap();

        let start = cache.find_start(blob.code_begin()).unwrap();
        assert_eq!(start.as_ptr() as *const u8, blob.begin());
    }

    #[test]
    fn test_cleanup_resets_staleness() {
        let cache = small_cache(AllocPolicy::Fail);
        let buf = stub_buffer(&[0x90; 100]);
        let a = cache
            .allocate_blob(BlobDescriptor::new("a", BlobKind::Buffer), &buf)
            .unwrap();
        let _b = cache
            .allocate_blob(BlobDescriptor::new("b", BlobKind::Buffer), &buf)
            .unwrap();
        unsafe { cache.free_blob(&a).unwrap() };

        cache.cleanup();
        assert_eq!(
            cache.heap_stats(HeapCategory::NonMethod).stale_segmap_bytes,
            0
        );
    }

    #[test]
    fn test_kinds_split_across_heaps() {
        let cache = small_cache(AllocPolicy::Fail);
        let buf = stub_buffer(&[0xC3]);
        let m = cache
            .allocate_blob(BlobDescriptor::new("m", BlobKind::Method), &buf)
            .unwrap();
        let s = cache
            .allocate_blob(BlobDescriptor::new("s", BlobKind::RuntimeStub), &buf)
            .unwrap();

        assert_eq!(cache.heap_stats(HeapCategory::Method).blob_count, 1);
        assert_eq!(cache.heap_stats(HeapCategory::NonMethod).blob_count, 1);
        assert_eq!(cache.stats().method_count(), 1);

        // Lookups cross heap boundaries transparently.
        assert!(Arc::ptr_eq(&cache.find_blob(m.code_begin()).unwrap(), &m));
        assert!(Arc::ptr_eq(&cache.find_blob(s.code_begin()).unwrap(), &s));
        assert!(cache.find_start(m.code_begin()).is_some());
        assert!(cache.find_start(s.code_begin()).is_some());

        unsafe { cache.free_blob(&m).unwrap() };
        assert_eq!(cache.stats().method_count(), 0);
        assert_eq!(cache.heap_stats(HeapCategory::Method).blob_count, 0);
    }
}
