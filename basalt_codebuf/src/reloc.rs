//! Relocation records for emitted code.
//!
//! Each section carries a side stream describing the positions in its bytes
//! that must be fixed up when the code lands at its final address: embedded
//! oop references, pointers to other sections of the same buffer, and raw
//! external addresses. Records are append-only and sorted by position, and
//! the stream is a forward delta-encoded byte sequence so it can be copied
//! into a blob verbatim and walked without an index.
//!
//! Every record is fixed-width for its kind, which keeps the encoded size a
//! pure function of the record list. Re-basing a stream to final layout
//! offsets therefore never changes its length.

use std::fmt;

use crate::section::SectionKind;

/// A growth-stable position inside a code buffer.
///
/// Raw addresses into a buffer die at the next expansion; a locator names the
/// same byte across any number of growth events and is resolved to an address
/// only at copy-out time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    /// Which section the position is in.
    pub section: SectionKind,
    /// Byte offset from the section's start.
    pub offset: u32,
}

impl Locator {
    /// Create a locator for `offset` within `section`.
    #[inline]
    pub const fn new(section: SectionKind, offset: u32) -> Self {
        Locator { section, offset }
    }
}

/// What a relocation record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Embedded managed-object reference; payload is an oop table index.
    Oop(u32),
    /// Embedded metadata reference; payload is a metadata table index.
    Metadata(u32),
    /// Reference to another position in the same buffer. The 8-byte field at
    /// the record's position is patched to the target's absolute address at
    /// copy-out.
    Internal(Locator),
    /// Absolute external address. The 8-byte field at the record's position
    /// is rewritten with the payload at copy-out.
    ExternalAddr(u64),
    /// Call to an external target. Recorded for later patching by the ISA
    /// layer; copy-out leaves the bytes untouched.
    CallTarget(u64),
}

impl RelocKind {
    const TAG_OOP: u8 = 0;
    const TAG_METADATA: u8 = 1;
    const TAG_INTERNAL: u8 = 2;
    const TAG_EXTERNAL: u8 = 3;
    const TAG_CALL: u8 = 4;

    #[inline]
    fn tag(&self) -> u8 {
        match self {
            RelocKind::Oop(_) => Self::TAG_OOP,
            RelocKind::Metadata(_) => Self::TAG_METADATA,
            RelocKind::Internal(_) => Self::TAG_INTERNAL,
            RelocKind::ExternalAddr(_) => Self::TAG_EXTERNAL,
            RelocKind::CallTarget(_) => Self::TAG_CALL,
        }
    }
}

/// A decoded relocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// Byte offset of the patch site within its section (or, for a blob's
    /// stream, within the content region).
    pub offset: u32,
    /// ISA-specific format hint, opaque to this layer.
    pub format: u8,
    /// What the site refers to.
    pub kind: RelocKind,
}

/// Errors from recording relocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocError {
    /// Records must be appended in non-decreasing position order.
    OutOfOrder {
        /// Position of the most recent record.
        last: u32,
        /// Position the caller tried to record.
        requested: u32,
    },
    /// The position lies outside the section's allocated range.
    OutOfRange {
        /// Offending position.
        offset: u32,
        /// Section capacity at the time of the call.
        limit: u32,
    },
    /// The buffer was created without relocation support.
    RelocationsDisabled,
}

impl fmt::Display for RelocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocError::OutOfOrder { last, requested } => write!(
                f,
                "Relocation at offset {} recorded after offset {}",
                requested, last
            ),
            RelocError::OutOfRange { offset, limit } => {
                write!(f, "Relocation offset {} outside section limit {}", offset, limit)
            }
            RelocError::RelocationsDisabled => {
                write!(f, "Buffer has no relocation support")
            }
        }
    }
}

impl std::error::Error for RelocError {}

/// An append-only, delta-encoded relocation stream.
///
/// Wire format per record: `delta: u32le`, `tag: u8`, `format: u8`, then a
/// tag-specific payload (`u32le` index, `u8 + u32le` locator, or `u64le`
/// address). `delta` is the position distance from the previous record.
#[derive(Debug, Default)]
pub struct RelocStream {
    bytes: Vec<u8>,
    point: u32,
    count: usize,
}

impl RelocStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        RelocStream {
            bytes: Vec::new(),
            point: 0,
            count: 0,
        }
    }

    /// Position of the most recent record.
    #[inline]
    pub fn point(&self) -> u32 {
        self.point
    }

    /// Number of records.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the stream has no records.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Encoded size in bytes.
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// The raw encoded bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Append a record at `offset`.
    ///
    /// Positions must be non-decreasing; the decoder walks the stream
    /// forward only.
    pub fn record(&mut self, offset: u32, format: u8, kind: RelocKind) -> Result<(), RelocError> {
        if offset < self.point {
            return Err(RelocError::OutOfOrder {
                last: self.point,
                requested: offset,
            });
        }
        let delta = offset - self.point;
        self.bytes.extend_from_slice(&delta.to_le_bytes());
        self.bytes.push(kind.tag());
        self.bytes.push(format);
        match kind {
            RelocKind::Oop(index) | RelocKind::Metadata(index) => {
                self.bytes.extend_from_slice(&index.to_le_bytes());
            }
            RelocKind::Internal(loc) => {
                self.bytes.push(loc.section as u8);
                self.bytes.extend_from_slice(&loc.offset.to_le_bytes());
            }
            RelocKind::ExternalAddr(addr) | RelocKind::CallTarget(addr) => {
                self.bytes.extend_from_slice(&addr.to_le_bytes());
            }
        }
        self.point = offset;
        self.count += 1;
        Ok(())
    }

    /// Iterate over decoded records in position order.
    pub fn iter(&self) -> RelocIter<'_> {
        RelocIter {
            bytes: &self.bytes,
            pos: 0,
            offset: 0,
        }
    }

    /// Append this stream's records into `dst` with every position shifted
    /// by `rebase`.
    ///
    /// Used when concatenating per-section streams into a blob's single
    /// content-relative stream. Record sizes are delta-independent, so the
    /// destination grows by exactly `self.size_in_bytes()`.
    pub fn append_rebased(&self, dst: &mut RelocStream, rebase: u32) -> Result<(), RelocError> {
        for entry in self.iter() {
            dst.record(entry.offset + rebase, entry.format, entry.kind)?;
        }
        Ok(())
    }
}

/// Forward iterator over an encoded relocation stream.
#[derive(Debug, Clone)]
pub struct RelocIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    offset: u32,
}

impl<'a> RelocIter<'a> {
    /// Walk a raw encoded stream, e.g. one copied into a blob.
    pub fn over(bytes: &'a [u8]) -> Self {
        RelocIter {
            bytes,
            pos: 0,
            offset: 0,
        }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let slice = self.bytes.get(self.pos..self.pos + N)?;
        self.pos += N;
        Some(slice.try_into().ok()?)
    }
}

impl Iterator for RelocIter<'_> {
    type Item = RelocEntry;

    fn next(&mut self) -> Option<RelocEntry> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let delta = u32::from_le_bytes(self.take::<4>()?);
        let tag = self.take::<1>()?[0];
        let format = self.take::<1>()?[0];
        let kind = match tag {
            RelocKind::TAG_OOP => RelocKind::Oop(u32::from_le_bytes(self.take::<4>()?)),
            RelocKind::TAG_METADATA => RelocKind::Metadata(u32::from_le_bytes(self.take::<4>()?)),
            RelocKind::TAG_INTERNAL => {
                let section = match self.take::<1>()?[0] {
                    0 => SectionKind::Consts,
                    1 => SectionKind::Insts,
                    2 => SectionKind::Stubs,
                    _ => return None,
                };
                let offset = u32::from_le_bytes(self.take::<4>()?);
                RelocKind::Internal(Locator::new(section, offset))
            }
            RelocKind::TAG_EXTERNAL => {
                RelocKind::ExternalAddr(u64::from_le_bytes(self.take::<8>()?))
            }
            RelocKind::TAG_CALL => RelocKind::CallTarget(u64::from_le_bytes(self.take::<8>()?)),
            _ => return None,
        };
        self.offset += delta;
        Some(RelocEntry {
            offset: self.offset,
            format,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_decode() {
        let mut stream = RelocStream::new();
        stream.record(0, 0, RelocKind::Oop(3)).unwrap();
        stream.record(8, 1, RelocKind::ExternalAddr(0xDEAD_BEEF)).unwrap();
        stream
            .record(8, 0, RelocKind::Internal(Locator::new(SectionKind::Consts, 16)))
            .unwrap();
        stream.record(24, 2, RelocKind::CallTarget(0x4000)).unwrap();

        let entries: Vec<RelocEntry> = stream.iter().collect();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[0].kind, RelocKind::Oop(3));
        assert_eq!(entries[1].offset, 8);
        assert_eq!(entries[1].kind, RelocKind::ExternalAddr(0xDEAD_BEEF));
        assert_eq!(entries[2].offset, 8);
        assert_eq!(
            entries[2].kind,
            RelocKind::Internal(Locator::new(SectionKind::Consts, 16))
        );
        assert_eq!(entries[3].offset, 24);
        assert_eq!(entries[3].format, 2);
        assert_eq!(stream.point(), 24);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut stream = RelocStream::new();
        stream.record(16, 0, RelocKind::Oop(0)).unwrap();
        let err = stream.record(8, 0, RelocKind::Oop(1)).unwrap_err();
        assert_eq!(
            err,
            RelocError::OutOfOrder {
                last: 16,
                requested: 8
            }
        );
        // The failed record must not have been appended.
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.point(), 16);
    }

    #[test]
    fn test_rebase_preserves_size_and_records() {
        let mut stream = RelocStream::new();
        stream.record(4, 0, RelocKind::Oop(1)).unwrap();
        stream.record(12, 0, RelocKind::CallTarget(0x1234)).unwrap();

        let mut dst = RelocStream::new();
        stream.append_rebased(&mut dst, 0x100).unwrap();
        assert_eq!(dst.size_in_bytes(), stream.size_in_bytes());

        let entries: Vec<RelocEntry> = dst.iter().collect();
        assert_eq!(entries[0].offset, 0x104);
        assert_eq!(entries[1].offset, 0x10C);
        assert_eq!(entries[1].kind, RelocKind::CallTarget(0x1234));
    }

    #[test]
    fn test_iter_over_raw_bytes() {
        let mut stream = RelocStream::new();
        stream.record(32, 0, RelocKind::Metadata(7)).unwrap();
        let copy = stream.as_bytes().to_vec();

        let entries: Vec<RelocEntry> = RelocIter::over(&copy).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, 32);
        assert_eq!(entries[0].kind, RelocKind::Metadata(7));
    }

    #[test]
    fn test_truncated_stream_stops() {
        let mut stream = RelocStream::new();
        stream.record(0, 0, RelocKind::ExternalAddr(1)).unwrap();
        let truncated = &stream.as_bytes()[..stream.size_in_bytes() - 2];
        assert_eq!(RelocIter::over(truncated).count(), 0);
    }
}
