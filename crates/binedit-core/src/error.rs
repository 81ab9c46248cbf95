//! Error types shared by the repository, documents and sources.

use crate::document::DocumentId;
use crate::segment::SegmentKey;
use crate::source::SourceId;
use thiserror::Error;

#[derive(Debug, Error)]
/// Errors reported by [`crate::Repository`] and [`crate::Document`] operations.
pub enum RepositoryError {
    #[error("I/O error: {0}")]
    /// Reading or writing a byte source failed.
    Io(#[from] std::io::Error),

    #[error("document not found: {0:?}")]
    /// The document id does not name an open document.
    DocumentNotFound(DocumentId),

    #[error("source not found: {0:?}")]
    /// The source id does not name a registered source.
    SourceNotFound(SourceId),

    #[error("segment not found: {0:?}")]
    /// The segment key does not name a live segment.
    SegmentNotFound(SegmentKey),

    #[error("range {position}+{length} is out of bounds (length {bound})")]
    /// A position/length pair reaches past the end of a document or source.
    OutOfBounds {
        /// Requested start position.
        position: u64,
        /// Requested length.
        length: u64,
        /// Length of the addressed document or source.
        bound: u64,
    },

    #[error("document {0:?} has no origin source")]
    /// Saving requires a document opened from a registered source.
    NoOrigin(DocumentId),

    #[error("source {0:?} is still referenced by live segments")]
    /// The source cannot be closed while segments point into it.
    SourceInUse(SourceId),

    #[error("source {0:?} is not a memory source")]
    /// A memory source was expected.
    NotMemorySource(SourceId),

    #[error("source {0:?} is not a registered file source")]
    /// A registered (file-backed) source was expected.
    NotFileSource(SourceId),

    #[error("segment {0:?} already belongs to a document")]
    /// The segment is owned by a document and cannot be reused or dropped directly.
    SegmentInUse(SegmentKey),

    #[error("segment {0:?} is not a memory segment")]
    /// The operation only applies to memory segments.
    NotMemorySegment(SegmentKey),

    #[error("space segments carry no start position")]
    /// Attempted to set or read the start position of a space segment.
    SpaceSegmentPosition,

    #[error("filling with non-zero byte {0:#04x} is not supported")]
    /// `fill_data` only supports a zero fill byte.
    UnsupportedFill(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Bookkeeping inconsistencies found by the `validate*` operations.
pub enum InvariantError {
    #[error("document length {recorded} differs from segment sum {actual}")]
    /// The cached document length disagrees with the segment list.
    LengthMismatch {
        /// Cached document length.
        recorded: u64,
        /// Sum of segment lengths.
        actual: u64,
    },

    #[error("window at segment {index} caches start {cached}, actual start is {actual}")]
    /// The position window points at a wrong start position.
    WindowMismatch {
        /// Segment index stored in the window.
        index: usize,
        /// Start position stored in the window.
        cached: u64,
        /// Start position found by traversal.
        actual: u64,
    },

    #[error("index records out of order at {0}")]
    /// Segment index records are not sorted by `(start, length)`.
    IndexOrder(usize),

    #[error("index max_end cache is stale at {0}")]
    /// A cached `max_end` value does not match the records to its left.
    IndexMaxEnd(usize),

    #[error("index record for {0:?} does not match a live segment")]
    /// An index record points at a dropped segment or at a stale range.
    OrphanRecord(SegmentKey),

    #[error("segment {0:?} has no index record")]
    /// A live segment is missing from its source's index.
    MissingRecord(SegmentKey),
}
