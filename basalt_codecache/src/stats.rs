//! Cache-wide counters.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::blob::BlobKind;

/// Statistics for the code cache.
///
/// All counters are relaxed atomics; readers get individually current
/// values, not a consistent cross-counter snapshot.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Bytes currently held by installed blobs.
    bytes_installed: AtomicUsize,
    /// Blobs installed over the cache's lifetime.
    install_count: AtomicUsize,
    /// Blobs freed over the cache's lifetime.
    free_count: AtomicUsize,
    /// Allocations refused because the heap was exhausted.
    failure_count: AtomicUsize,
    /// Compiled methods currently installed.
    method_count: AtomicUsize,
    /// Adapters currently installed.
    adapter_count: AtomicUsize,
}

impl CacheStats {
    /// Create new empty stats.
    pub const fn new() -> Self {
        CacheStats {
            bytes_installed: AtomicUsize::new(0),
            install_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
            failure_count: AtomicUsize::new(0),
            method_count: AtomicUsize::new(0),
            adapter_count: AtomicUsize::new(0),
        }
    }

    /// Record a blob installation.
    pub fn record_install(&self, bytes: usize, kind: BlobKind) {
        self.bytes_installed.fetch_add(bytes, Ordering::Relaxed);
        self.install_count.fetch_add(1, Ordering::Relaxed);
        match kind {
            BlobKind::Method => {
                self.method_count.fetch_add(1, Ordering::Relaxed);
            }
            BlobKind::Adapter => {
                self.adapter_count.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Record a blob free.
    pub fn record_free(&self, bytes: usize, kind: BlobKind) {
        self.bytes_installed.fetch_sub(bytes, Ordering::Relaxed);
        self.free_count.fetch_add(1, Ordering::Relaxed);
        match kind {
            BlobKind::Method => {
                self.method_count.fetch_sub(1, Ordering::Relaxed);
            }
            BlobKind::Adapter => {
                self.adapter_count.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Record a refused allocation.
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes currently held by installed blobs.
    pub fn bytes_installed(&self) -> usize {
        self.bytes_installed.load(Ordering::Relaxed)
    }

    /// Lifetime installation count.
    pub fn installs(&self) -> usize {
        self.install_count.load(Ordering::Relaxed)
    }

    /// Lifetime free count.
    pub fn frees(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Lifetime refused-allocation count.
    pub fn failures(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Compiled methods currently installed.
    pub fn method_count(&self) -> usize {
        self.method_count.load(Ordering::Relaxed)
    }

    /// Adapters currently installed.
    pub fn adapter_count(&self) -> usize {
        self.adapter_count.load(Ordering::Relaxed)
    }
}
