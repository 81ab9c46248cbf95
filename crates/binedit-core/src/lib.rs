#![warn(missing_docs)]
//! Binedit Core - Segment-Based Binary Document Engine
//!
//! # Overview
//!
//! `binedit-core` edits arbitrarily large binary files without loading them. A document is a
//! sequence of segments, each referencing a range of some byte source: the file it was opened
//! from, an in-memory buffer holding inserted bytes, or an empty placeholder used while saving.
//! Edits rearrange segments; bytes are only copied when they are written back.
//!
//! # Core Features
//!
//! - **Lazy Documents**: opening a file creates one segment; nothing is read until asked for
//! - **Shared Segments**: copy/paste between (or within) documents shares bytes, with
//!   copy-on-write for in-memory data
//! - **Overlap Index**: every source knows which segments reference which of its ranges
//! - **Safe In-Place Save**: a document can be saved into the file its own segments read from,
//!   while other documents opened on the same file keep their content
//! - **Change Notifications**: subscribers are told about every mutation, save and disposal
//!
//! # Architecture Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Document facade                            │  ← Public API
//! ├─────────────────────────────────────────────┤
//! │  Repository (documents, segments, save)     │  ← Ownership & Persistence
//! ├─────────────────────────────────────────────┤
//! │  Segment Index (per source)                 │  ← Overlap Queries
//! ├─────────────────────────────────────────────┤
//! │  Byte Sources (file, memory)                │  ← Storage
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use binedit_core::{MemorySource, Repository};
//!
//! let mut repository = Repository::new();
//! let file = repository.register_source(MemorySource::from_vec(b"0123456789".to_vec()));
//! let id = repository.create_document_from(file).unwrap();
//!
//! let mut document = repository.document(id).unwrap();
//! // Duplicate the second half in front of the first.
//! document.insert_document(0, id, 5, 5).unwrap();
//! assert_eq!(document.read_all().unwrap(), b"567890123456789");
//! document.save().unwrap();
//!
//! assert_eq!(repository.source_length(file).unwrap(), 15);
//! ```
//!
//! # Module Description
//!
//! - [`source`] - Byte source trait with file and memory implementations
//! - [`segment`] - Segment variants
//! - [`segment_index`] - Per-source overlap index
//! - [`document`] - Document facade and segment list editing
//! - [`repository`] - Ownership of sources, segments and documents
//! - [`events`] - Change notifications
//! - [`error`] - Error types

pub mod document;
pub mod error;
pub mod events;
pub mod repository;
mod save;
pub mod segment;
pub mod segment_index;
pub mod source;

pub use document::{Document, DocumentId};
pub use error::{InvariantError, RepositoryError};
pub use events::{DocumentChange, RepositoryCallback, RepositoryEvent};
pub use repository::{DEFAULT_BUFFER_SIZE, DEFAULT_SAVE_CHUNK_SIZE, Repository, RepositoryConfig};
pub use segment::{Segment, SegmentKey, SegmentKind};
pub use segment_index::{IndexRecord, SegmentIndex};
pub use source::{ByteSource, DEFAULT_CACHE_BLOCK_SIZE, FileSource, MemorySource, SourceId};
