//! Code heap configuration parameters.
//!
//! All sizes and thresholds are tunable. Defaults suit a mid-sized JIT
//! workload; embedders with many small stubs or few large methods should
//! adjust the segment size accordingly.

/// Configuration for a [`CodeHeap`](crate::CodeHeap).
///
/// # Example
///
/// ```ignore
/// use basalt_codeheap::HeapConfig;
///
/// // A small heap for stub routines only
/// let config = HeapConfig {
///     reserved_size: 1024 * 1024,
///     segment_size: 64,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Total address space reserved for the heap in bytes.
    ///
    /// Reserved up front so block addresses never move; committed lazily
    /// as the heap fills. This is the hard capacity limit.
    ///
    /// Default: 16MB
    pub reserved_size: usize,

    /// Granularity of allocation in bytes. Must be a power of two.
    ///
    /// Every block occupies a whole number of segments, and the segment
    /// map spends one byte of bookkeeping per segment. Smaller segments
    /// waste less space per block but grow the map.
    ///
    /// Default: 128
    pub segment_size: usize,

    /// Bytes of committed memory added per expansion of the high-water
    /// mark. Rounded up to page granularity.
    ///
    /// Default: 64KB
    pub commit_increment: usize,

    /// Stale segment-map bytes tolerated before a defragmentation sweep.
    ///
    /// Freeing and merging blocks leaves interior segment-map bytes
    /// pointing at defunct block starts; lookups stay correct but walk
    /// longer chains. When the stale count passes this limit the next
    /// free triggers [`CodeHeap::defrag_segmap`](crate::CodeHeap::defrag_segmap).
    /// Set to 0 to sweep after every free.
    ///
    /// Default: 10000
    pub fragmentation_limit: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            reserved_size: 16 * 1024 * 1024, // 16MB
            segment_size: 128,
            commit_increment: 64 * 1024, // 64KB
            fragmentation_limit: 10_000,
        }
    }
}

impl HeapConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.segment_size.is_power_of_two() || self.segment_size < 64 {
            return Err(ConfigError::InvalidSegmentSize);
        }
        if self.reserved_size < 4 * self.segment_size {
            return Err(ConfigError::ReservationTooSmall);
        }
        if self.commit_increment == 0 {
            return Err(ConfigError::InvalidCommitIncrement);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Segment size must be a power of two, minimum 64.
    InvalidSegmentSize,
    /// Reservation must hold at least a handful of segments.
    ReservationTooSmall,
    /// Commit increment must be non-zero.
    InvalidCommitIncrement,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidSegmentSize => {
                write!(f, "segment size must be a power of two, minimum 64")
            }
            ConfigError::ReservationTooSmall => {
                write!(f, "reservation must be at least four segments")
            }
            ConfigError::InvalidCommitIncrement => {
                write!(f, "commit increment must be non-zero")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(HeapConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_segment_size() {
        let config = HeapConfig {
            segment_size: 100, // Not a power of two
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidSegmentSize));
    }

    #[test]
    fn test_reservation_too_small() {
        let config = HeapConfig {
            reserved_size: 256,
            segment_size: 128,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ReservationTooSmall));
    }
}
