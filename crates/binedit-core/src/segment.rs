//! Segments: typed references to byte ranges.
//!
//! A document is a sequence of segments. Each segment either points at a range of a registered
//! (file-backed) source, at a range of a memory source, or is a [`Segment::Space`] placeholder
//! that only carries a length. Space segments exist only while a document is being saved and
//! mark regions that are already flushed.

use crate::error::RepositoryError;
use crate::source::SourceId;

slotmap::new_key_type! {
    /// Stable handle of a segment owned by a [`crate::Repository`].
    pub struct SegmentKey;
}

/// Segment variant without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Range of a registered source.
    Source,
    /// Range of a memory source.
    Memory,
    /// Length-only placeholder.
    Space,
}

/// Reference to a contiguous byte range, or a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    /// `[start, start + length)` of a registered source.
    Source {
        /// Referenced source.
        source: SourceId,
        /// Start position in the source.
        start: u64,
        /// Length in bytes.
        length: u64,
    },
    /// `[start, start + length)` of a memory source.
    Memory {
        /// Referenced memory source.
        source: SourceId,
        /// Start position in the source.
        start: u64,
        /// Length in bytes.
        length: u64,
    },
    /// Placeholder without backing bytes.
    Space {
        /// Length in bytes.
        length: u64,
    },
}

impl Segment {
    /// Variant of this segment.
    pub fn kind(&self) -> SegmentKind {
        match self {
            Segment::Source { .. } => SegmentKind::Source,
            Segment::Memory { .. } => SegmentKind::Memory,
            Segment::Space { .. } => SegmentKind::Space,
        }
    }

    /// Length in bytes.
    pub fn length(&self) -> u64 {
        match *self {
            Segment::Source { length, .. }
            | Segment::Memory { length, .. }
            | Segment::Space { length } => length,
        }
    }

    /// Referenced source, `None` for space segments.
    pub fn source(&self) -> Option<SourceId> {
        match *self {
            Segment::Source { source, .. } | Segment::Memory { source, .. } => Some(source),
            Segment::Space { .. } => None,
        }
    }

    /// Start position in the referenced source, `None` for space segments.
    pub fn start(&self) -> Option<u64> {
        match *self {
            Segment::Source { start, .. } | Segment::Memory { start, .. } => Some(start),
            Segment::Space { .. } => None,
        }
    }

    /// Returns `true` for the space placeholder.
    pub fn is_space(&self) -> bool {
        matches!(self, Segment::Space { .. })
    }

    /// Same variant and source, with a new start position and length.
    pub fn with_range(self, start: u64, length: u64) -> Result<Self, RepositoryError> {
        match self {
            Segment::Source { source, .. } => Ok(Segment::Source {
                source,
                start,
                length,
            }),
            Segment::Memory { source, .. } => Ok(Segment::Memory {
                source,
                start,
                length,
            }),
            Segment::Space { .. } => Err(RepositoryError::SpaceSegmentPosition),
        }
    }

    /// Sub-range `[offset, offset + length)` of this segment.
    ///
    /// Panics when the sub-range reaches past the end of the segment.
    pub fn slice(self, offset: u64, length: u64) -> Self {
        assert!(
            offset + length <= self.length(),
            "slice {offset}+{length} exceeds segment length {}",
            self.length()
        );
        match self {
            Segment::Source { source, start, .. } => Segment::Source {
                source,
                start: start + offset,
                length,
            },
            Segment::Memory { source, start, .. } => Segment::Memory {
                source,
                start: start + offset,
                length,
            },
            Segment::Space { .. } => Segment::Space { length },
        }
    }

    /// Single segment covering `self` followed by `next`, if they reference contiguous ranges of
    /// the same source with the same variant.
    pub fn merged_with(&self, next: &Segment) -> Option<Segment> {
        match (*self, *next) {
            (
                Segment::Source {
                    source,
                    start,
                    length,
                },
                Segment::Source {
                    source: next_source,
                    start: next_start,
                    length: next_length,
                },
            ) if source == next_source && start + length == next_start => Some(Segment::Source {
                source,
                start,
                length: length + next_length,
            }),
            (
                Segment::Memory {
                    source,
                    start,
                    length,
                },
                Segment::Memory {
                    source: next_source,
                    start: next_start,
                    length: next_length,
                },
            ) if source == next_source && start + length == next_start => Some(Segment::Memory {
                source,
                start,
                length: length + next_length,
            }),
            _ => None,
        }
    }
}
