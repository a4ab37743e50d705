//! Oop maps for compiled frames.
//!
//! An [`OopMap`] records which frame slots hold managed pointers when
//! execution is stopped at one particular code offset; an [`OopMapSet`]
//! collects the maps for every such stop point in a blob, sorted by offset
//! for binary-search lookup from a program counter.

use std::fmt;

use smallvec::SmallVec;

/// Frame-slot index within a compiled frame.
pub type SlotIndex = u16;

/// Managed-pointer locations for one stop point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OopMap {
    /// Code offset of the stop point, relative to the blob's code begin.
    pc_offset: u32,
    /// Frame slots holding managed pointers at that offset.
    slots: SmallVec<[SlotIndex; 8]>,
}

impl OopMap {
    /// Create an empty map for the given code offset.
    pub fn new(pc_offset: u32) -> Self {
        OopMap {
            pc_offset,
            slots: SmallVec::new(),
        }
    }

    /// Mark a frame slot as holding a managed pointer.
    pub fn set_oop(&mut self, slot: SlotIndex) {
        if !self.slots.contains(&slot) {
            self.slots.push(slot);
        }
    }

    /// Builder-style [`OopMap::set_oop`].
    pub fn with_oop(mut self, slot: SlotIndex) -> Self {
        self.set_oop(slot);
        self
    }

    /// The code offset this map describes.
    #[inline]
    pub fn pc_offset(&self) -> u32 {
        self.pc_offset
    }

    /// The recorded slots.
    #[inline]
    pub fn slots(&self) -> &[SlotIndex] {
        &self.slots
    }

    /// Number of recorded slots.
    #[inline]
    pub fn oop_count(&self) -> usize {
        self.slots.len()
    }
}

/// All oop maps of one blob, ordered by code offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OopMapSet {
    maps: Vec<OopMap>,
}

impl OopMapSet {
    /// Create an empty set.
    pub fn new() -> Self {
        OopMapSet { maps: Vec::new() }
    }

    /// Add a map, keeping the set ordered.
    ///
    /// Replaces any existing map at the same offset.
    pub fn add(&mut self, map: OopMap) {
        match self.maps.binary_search_by_key(&map.pc_offset, |m| m.pc_offset) {
            Ok(i) => self.maps[i] = map,
            Err(i) => self.maps.insert(i, map),
        }
    }

    /// The map at exactly `pc_offset`, if any.
    pub fn find_at(&self, pc_offset: u32) -> Option<&OopMap> {
        self.maps
            .binary_search_by_key(&pc_offset, |m| m.pc_offset)
            .ok()
            .map(|i| &self.maps[i])
    }

    /// Number of maps in the set.
    #[inline]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Whether the set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Iterate over the maps in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &OopMap> {
        self.maps.iter()
    }
}

impl fmt::Display for OopMapSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OopMapSet[{} maps]", self.maps.len())
    }
}
