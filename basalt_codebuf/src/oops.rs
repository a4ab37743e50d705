//! Recording of embedded managed-object and metadata references.
//!
//! While code is emitted, any oop or metadata value baked into the
//! instruction stream is interned here. The recorder deduplicates values and
//! hands back table indices for relocation records; the tables themselves are
//! copied into the blob's data region at construction so the GC can find
//! every embedded reference without decoding instructions.

use rustc_hash::FxHashMap;

use crate::layout::WORD_SIZE;

/// Opaque handle to a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OopHandle(pub u64);

/// Opaque handle to VM metadata (a method, class, or similar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataHandle(pub u64);

/// Interning tables for references embedded in generated code.
#[derive(Debug, Default)]
pub struct OopRecorder {
    oops: Vec<OopHandle>,
    oop_index: FxHashMap<OopHandle, u32>,
    metadata: Vec<MetadataHandle>,
    metadata_index: FxHashMap<MetadataHandle, u32>,
}

impl OopRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        OopRecorder::default()
    }

    /// Intern an oop, returning its table index.
    pub fn find_oop_index(&mut self, oop: OopHandle) -> u32 {
        if let Some(&index) = self.oop_index.get(&oop) {
            return index;
        }
        let index = self.oops.len() as u32;
        self.oops.push(oop);
        self.oop_index.insert(oop, index);
        index
    }

    /// Intern a metadata handle, returning its table index.
    pub fn find_metadata_index(&mut self, metadata: MetadataHandle) -> u32 {
        if let Some(&index) = self.metadata_index.get(&metadata) {
            return index;
        }
        let index = self.metadata.len() as u32;
        self.metadata.push(metadata);
        self.metadata_index.insert(metadata, index);
        index
    }

    /// Number of interned oops.
    #[inline]
    pub fn oop_count(&self) -> usize {
        self.oops.len()
    }

    /// Number of interned metadata handles.
    #[inline]
    pub fn metadata_count(&self) -> usize {
        self.metadata.len()
    }

    /// Whether nothing has been recorded.
    #[inline]
    pub fn is_unused(&self) -> bool {
        self.oops.is_empty() && self.metadata.is_empty()
    }

    /// Size of the oop table in bytes.
    #[inline]
    pub fn oops_size_in_bytes(&self) -> usize {
        self.oops.len() * WORD_SIZE
    }

    /// Size of the metadata table in bytes.
    #[inline]
    pub fn metadata_size_in_bytes(&self) -> usize {
        self.metadata.len() * WORD_SIZE
    }

    /// The interned oops in index order.
    #[inline]
    pub fn oops(&self) -> &[OopHandle] {
        &self.oops
    }

    /// The interned metadata handles in index order.
    #[inline]
    pub fn metadata(&self) -> &[MetadataHandle] {
        &self.metadata
    }

    /// Serialize the oop table into `out` (little-endian words).
    pub fn copy_oops_to(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= self.oops_size_in_bytes());
        for (i, oop) in self.oops.iter().enumerate() {
            out[i * WORD_SIZE..(i + 1) * WORD_SIZE].copy_from_slice(&oop.0.to_le_bytes());
        }
    }

    /// Serialize the metadata table into `out` (little-endian words).
    pub fn copy_metadata_to(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= self.metadata_size_in_bytes());
        for (i, handle) in self.metadata.iter().enumerate() {
            out[i * WORD_SIZE..(i + 1) * WORD_SIZE].copy_from_slice(&handle.0.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oop_interning_dedups() {
        let mut recorder = OopRecorder::new();
        let a = recorder.find_oop_index(OopHandle(0x1000));
        let b = recorder.find_oop_index(OopHandle(0x2000));
        let a_again = recorder.find_oop_index(OopHandle(0x1000));

        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(a_again, a);
        assert_eq!(recorder.oop_count(), 2);
    }

    #[test]
    fn test_metadata_independent_of_oops() {
        let mut recorder = OopRecorder::new();
        recorder.find_oop_index(OopHandle(7));
        let m = recorder.find_metadata_index(MetadataHandle(7));
        assert_eq!(m, 0);
        assert_eq!(recorder.oop_count(), 1);
        assert_eq!(recorder.metadata_count(), 1);
        assert!(!recorder.is_unused());
    }

    #[test]
    fn test_copy_tables() {
        let mut recorder = OopRecorder::new();
        recorder.find_oop_index(OopHandle(0x0102_0304_0506_0708));
        recorder.find_oop_index(OopHandle(0x1111));

        let mut out = vec![0u8; recorder.oops_size_in_bytes()];
        recorder.copy_oops_to(&mut out);
        assert_eq!(
            u64::from_le_bytes(out[0..8].try_into().unwrap()),
            0x0102_0304_0506_0708
        );
        assert_eq!(u64::from_le_bytes(out[8..16].try_into().unwrap()), 0x1111);
    }
}
