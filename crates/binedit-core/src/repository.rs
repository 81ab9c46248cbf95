//! The repository: owner of every source, segment index, segment and document.
//!
//! Documents and segments never own bytes or register themselves anywhere. They are entries in
//! the repository's arenas, addressed by [`DocumentId`] and [`SegmentKey`], and every operation
//! that creates, moves or drops a segment goes through the repository so the per-source
//! [`SegmentIndex`] stays in sync.
//!
//! # Example
//!
//! ```rust
//! use binedit_core::{MemorySource, Repository};
//!
//! let mut repository = Repository::new();
//! let file = repository.register_source(MemorySource::from_vec(b"0123456789".to_vec()));
//! let id = repository.create_document_from(file).unwrap();
//!
//! let mut document = repository.document(id).unwrap();
//! document.insert(0, b"<<").unwrap();
//! document.remove(7, 5).unwrap();
//! document.save().unwrap();
//!
//! let mut saved = vec![0; 7];
//! repository.read_source(file, 0, &mut saved).unwrap();
//! assert_eq!(&saved, b"<<01234");
//! ```

use crate::document::{Document, DocumentData, DocumentId};
use crate::error::{InvariantError, RepositoryError};
use crate::events::{DocumentChange, RepositoryCallback, RepositoryEvent};
use crate::segment::{Segment, SegmentKey};
use crate::segment_index::SegmentIndex;
use crate::source::{ByteSource, MemorySource, SourceId, to_index};
use log::trace;
use slotmap::{SecondaryMap, SlotMap};
use std::fmt;

/// Default size of the block buffer used for streamed copies.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default size of the chunks written while resolving save conflicts.
pub const DEFAULT_SAVE_CHUNK_SIZE: u64 = 64 * 1024;

/// Tunables of a [`Repository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Block size of streamed copies, stream load/save and reverse copying.
    pub buffer_size: usize,
    /// Largest chunk written at once while flushing conflicting segments on save.
    pub save_chunk_size: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            save_chunk_size: DEFAULT_SAVE_CHUNK_SIZE,
        }
    }
}

impl RepositoryConfig {
    /// Set the copy block size (minimum 1).
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Set the save chunk size (minimum 1).
    pub fn with_save_chunk_size(mut self, save_chunk_size: u64) -> Self {
        self.save_chunk_size = save_chunk_size.max(1);
        self
    }
}

pub(crate) enum SourceStorage {
    /// Registered source, typically a file. Documents can be opened from and saved to it.
    File(Box<dyn ByteSource>),
    /// In-memory bytes. Private ones are released when their last segment goes away.
    Memory {
        data: MemorySource,
        release_when_unused: bool,
    },
}

pub(crate) struct SourceEntry {
    pub(crate) storage: SourceStorage,
    pub(crate) index: SegmentIndex,
}

impl SourceEntry {
    fn memory(data: MemorySource, release_when_unused: bool) -> Self {
        Self {
            storage: SourceStorage::Memory {
                data,
                release_when_unused,
            },
            index: SegmentIndex::new(),
        }
    }

    pub(crate) fn bytes(&self) -> &dyn ByteSource {
        match &self.storage {
            SourceStorage::File(source) => source.as_ref(),
            SourceStorage::Memory { data, .. } => data,
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut dyn ByteSource {
        match &mut self.storage {
            SourceStorage::File(source) => source.as_mut(),
            SourceStorage::Memory { data, .. } => data,
        }
    }

    pub(crate) fn is_file(&self) -> bool {
        matches!(self.storage, SourceStorage::File(_))
    }
}

/// Owner of sources, segment indices, segments and documents.
pub struct Repository {
    pub(crate) config: RepositoryConfig,
    pub(crate) sources: SlotMap<SourceId, SourceEntry>,
    pub(crate) segments: SlotMap<SegmentKey, Segment>,
    pub(crate) documents: SlotMap<DocumentId, DocumentData>,
    /// Segments handed out to the caller that no document holds yet
    free_segments: SecondaryMap<SegmentKey, ()>,
    callbacks: Vec<RepositoryCallback>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.config)
            .field("sources", &self.sources.len())
            .field("segments", &self.segments.len())
            .field("documents", &self.documents.len())
            .finish()
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    /// Create a repository with default settings.
    pub fn new() -> Self {
        Self::with_config(RepositoryConfig::default())
    }

    /// Create a repository with custom settings.
    pub fn with_config(config: RepositoryConfig) -> Self {
        Self {
            config,
            sources: SlotMap::with_key(),
            segments: SlotMap::with_key(),
            documents: SlotMap::with_key(),
            free_segments: SecondaryMap::new(),
            callbacks: Vec::new(),
        }
    }

    /// Current settings.
    pub fn config(&self) -> RepositoryConfig {
        self.config
    }

    /// Subscribe to document change events.
    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: FnMut(&RepositoryEvent) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    pub(crate) fn notify(&mut self, event: RepositoryEvent) {
        for callback in &mut self.callbacks {
            callback(&event);
        }
    }

    // ---------------------------------------------------------------------
    // Sources
    // ---------------------------------------------------------------------

    /// Register a persistent source (usually a [`crate::FileSource`]) documents can be opened from
    /// and saved to.
    pub fn register_source<S>(&mut self, source: S) -> SourceId
    where
        S: ByteSource + 'static,
    {
        self.sources.insert(SourceEntry {
            storage: SourceStorage::File(Box::new(source)),
            index: SegmentIndex::new(),
        })
    }

    /// Close and forget a registered source.
    pub fn unregister_source(&mut self, id: SourceId) -> Result<(), RepositoryError> {
        let entry = self.sources.get(id).ok_or(RepositoryError::SourceNotFound(id))?;
        if !entry.is_file() {
            return Err(RepositoryError::NotFileSource(id));
        }
        let is_origin = self.documents.values().any(|doc| doc.origin == Some(id));
        if !entry.index.is_empty() || is_origin {
            return Err(RepositoryError::SourceInUse(id));
        }
        if let Some(mut entry) = self.sources.remove(id) {
            entry.bytes_mut().close()?;
        }
        Ok(())
    }

    /// Open an empty memory source owned by the caller.
    pub fn open_memory_source(&mut self) -> SourceId {
        self.sources
            .insert(SourceEntry::memory(MemorySource::new(), false))
    }

    /// Forget a memory source that no segment references anymore.
    pub fn close_memory_source(&mut self, id: SourceId) -> Result<(), RepositoryError> {
        let entry = self.sources.get(id).ok_or(RepositoryError::SourceNotFound(id))?;
        if entry.is_file() {
            return Err(RepositoryError::NotMemorySource(id));
        }
        if !entry.index.is_empty() {
            return Err(RepositoryError::SourceInUse(id));
        }
        self.sources.remove(id);
        Ok(())
    }

    pub(crate) fn open_private_memory_source(&mut self, data: Vec<u8>) -> SourceId {
        self.sources
            .insert(SourceEntry::memory(MemorySource::from_vec(data), true))
    }

    fn release_if_unused(&mut self, id: SourceId) {
        let release = self.sources.get(id).is_some_and(|entry| {
            entry.index.is_empty()
                && matches!(
                    entry.storage,
                    SourceStorage::Memory {
                        release_when_unused: true,
                        ..
                    }
                )
        });
        if release {
            trace!("releasing unused memory source {id:?}");
            self.sources.remove(id);
        }
    }

    /// Length of a source.
    pub fn source_length(&self, id: SourceId) -> Result<u64, RepositoryError> {
        let entry = self.sources.get(id).ok_or(RepositoryError::SourceNotFound(id))?;
        Ok(entry.bytes().length())
    }

    /// Read raw bytes of a source. Returns the number of bytes read.
    pub fn read_source(
        &mut self,
        id: SourceId,
        position: u64,
        buffer: &mut [u8],
    ) -> Result<usize, RepositoryError> {
        let entry = self
            .sources
            .get_mut(id)
            .ok_or(RepositoryError::SourceNotFound(id))?;
        let bytes = entry.bytes_mut();
        let available = bytes.length().saturating_sub(position);
        let count = (buffer.len() as u64).min(available) as usize;
        bytes.read_fully(position, &mut buffer[..count])?;
        Ok(count)
    }

    /// Write raw bytes into a source.
    ///
    /// This bypasses copy-on-write: segments referencing the range observe the new bytes.
    pub fn write_source(
        &mut self,
        id: SourceId,
        position: u64,
        data: &[u8],
    ) -> Result<(), RepositoryError> {
        let entry = self
            .sources
            .get_mut(id)
            .ok_or(RepositoryError::SourceNotFound(id))?;
        entry.bytes_mut().write(position, data)?;
        Ok(())
    }

    /// Number of live segments referencing a source.
    pub fn source_segment_count(&self, id: SourceId) -> Result<usize, RepositoryError> {
        let entry = self.sources.get(id).ok_or(RepositoryError::SourceNotFound(id))?;
        Ok(entry.index.len())
    }

    /// Number of sources, including private memory sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Check every segment index against the live segments.
    pub fn validate_indices(&self) -> Result<(), InvariantError> {
        let mut indexed: SecondaryMap<SegmentKey, ()> = SecondaryMap::new();
        for entry in self.sources.values() {
            entry.index.validate()?;
            for record in entry.index.records() {
                let matches = self.segments.get(record.segment).is_some_and(|segment| {
                    segment.start() == Some(record.start) && segment.length() == record.length
                });
                if !matches || indexed.insert(record.segment, ()).is_some() {
                    return Err(InvariantError::OrphanRecord(record.segment));
                }
            }
        }
        match self
            .segments
            .iter()
            .find(|(key, segment)| !segment.is_space() && !indexed.contains_key(*key))
        {
            Some((key, _)) => Err(InvariantError::MissingRecord(key)),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Segments
    // ---------------------------------------------------------------------

    fn index_segment(&mut self, key: SegmentKey, segment: &Segment) {
        if let (Some(source), Some(start)) = (segment.source(), segment.start()) {
            self.sources[source].index.add(key, start, segment.length());
        }
    }

    fn unindex_segment(&mut self, key: SegmentKey, segment: &Segment) {
        if let (Some(source), Some(start)) = (segment.source(), segment.start()) {
            self.sources[source].index.remove(key, start, segment.length());
        }
    }

    /// Store a segment and register it in its source's index.
    pub(crate) fn register_segment(&mut self, segment: Segment) -> SegmentKey {
        let key = self.segments.insert(segment);
        self.index_segment(key, &segment);
        key
    }

    /// Re-point an existing segment, keeping the indices in sync.
    pub(crate) fn replace_segment(&mut self, key: SegmentKey, segment: Segment) {
        let old = self.segments[key];
        self.unindex_segment(key, &old);
        self.segments[key] = segment;
        self.index_segment(key, &segment);
        if let Some(source) = old.source() {
            self.release_if_unused(source);
        }
    }

    /// Drop a segment and its index record.
    pub(crate) fn discard_segment(&mut self, key: SegmentKey) {
        let Some(segment) = self.segments.remove(key) else {
            panic!("segment {key:?} dropped twice");
        };
        self.free_segments.remove(key);
        self.unindex_segment(key, &segment);
        if let Some(source) = segment.source() {
            self.release_if_unused(source);
        }
    }

    /// Shrink `key` to its first `offset` bytes and return a new segment for the rest.
    pub(crate) fn split_segment(&mut self, key: SegmentKey, offset: u64) -> SegmentKey {
        let segment = self.segments[key];
        let right = segment.slice(offset, segment.length() - offset);
        self.replace_segment(key, segment.slice(0, offset));
        self.register_segment(right)
    }

    /// Register a segment the caller owns until it is spliced into a document.
    fn register_free_segment(&mut self, segment: Segment) -> SegmentKey {
        let key = self.register_segment(segment);
        self.free_segments.insert(key, ());
        key
    }

    /// Hand a free segment over to a document.
    pub(crate) fn claim_segment(&mut self, key: SegmentKey) -> Result<Segment, RepositoryError> {
        let segment = self
            .segment(key)
            .ok_or(RepositoryError::SegmentNotFound(key))?;
        if self.free_segments.remove(key).is_none() {
            return Err(RepositoryError::SegmentInUse(key));
        }
        Ok(segment)
    }

    /// Look up a segment.
    pub fn segment(&self, key: SegmentKey) -> Option<Segment> {
        self.segments.get(key).copied()
    }

    /// Create a segment referencing `[start, start + length)` of a registered source.
    pub fn create_source_segment(
        &mut self,
        source: SourceId,
        start: u64,
        length: u64,
    ) -> Result<SegmentKey, RepositoryError> {
        let entry = self
            .sources
            .get(source)
            .ok_or(RepositoryError::SourceNotFound(source))?;
        if !entry.is_file() {
            return Err(RepositoryError::NotFileSource(source));
        }
        check_range(start, length, entry.bytes().length())?;
        Ok(self.register_free_segment(Segment::Source {
            source,
            start,
            length,
        }))
    }

    /// Create a segment referencing `[start, start + length)` of a memory source.
    pub fn create_memory_segment(
        &mut self,
        source: SourceId,
        start: u64,
        length: u64,
    ) -> Result<SegmentKey, RepositoryError> {
        let entry = self
            .sources
            .get(source)
            .ok_or(RepositoryError::SourceNotFound(source))?;
        if entry.is_file() {
            return Err(RepositoryError::NotMemorySource(source));
        }
        check_range(start, length, entry.bytes().length())?;
        Ok(self.register_free_segment(Segment::Memory {
            source,
            start,
            length,
        }))
    }

    /// New segment of the same variant referencing the same range.
    ///
    /// Memory copies alias the original bytes until one of them is written through.
    pub fn copy_segment(&mut self, key: SegmentKey) -> Result<SegmentKey, RepositoryError> {
        let segment = self
            .segment(key)
            .ok_or(RepositoryError::SegmentNotFound(key))?;
        Ok(self.register_free_segment(segment))
    }

    /// New segment referencing `[offset, offset + length)` of an existing one.
    pub fn copy_segment_range(
        &mut self,
        key: SegmentKey,
        offset: u64,
        length: u64,
    ) -> Result<SegmentKey, RepositoryError> {
        let segment = self
            .segment(key)
            .ok_or(RepositoryError::SegmentNotFound(key))?;
        check_range(offset, length, segment.length())?;
        Ok(self.register_free_segment(segment.slice(offset, length)))
    }

    /// Drop a segment that is not part of any document.
    pub fn drop_segment(&mut self, key: SegmentKey) -> Result<(), RepositoryError> {
        if !self.segments.contains_key(key) {
            return Err(RepositoryError::SegmentNotFound(key));
        }
        if !self.free_segments.contains_key(key) {
            return Err(RepositoryError::SegmentInUse(key));
        }
        self.discard_segment(key);
        Ok(())
    }

    /// Read `buffer.len()` bytes of `segment` starting at `offset` within it.
    pub(crate) fn read_segment(
        &mut self,
        segment: &Segment,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), RepositoryError> {
        match *segment {
            Segment::Source { source, start, .. } | Segment::Memory { source, start, .. } => {
                self.sources[source]
                    .bytes_mut()
                    .read_fully(start + offset, buffer)?;
                Ok(())
            }
            Segment::Space { .. } => panic!("attempted to read from a space segment"),
        }
    }

    /// Copy the bytes of `key` into a fresh private memory source and re-point the segment there.
    pub(crate) fn materialize(&mut self, key: SegmentKey) -> Result<(), RepositoryError> {
        let segment = self.segments[key];
        let length = segment.length();
        let mut bytes = vec![0; to_index(length)?];
        self.read_segment(&segment, 0, &mut bytes)?;
        let source = self.open_private_memory_source(bytes);
        self.replace_segment(
            key,
            Segment::Memory {
                source,
                start: 0,
                length,
            },
        );
        Ok(())
    }

    /// Give a memory segment its own private copy of its bytes.
    pub fn detach_segment(&mut self, key: SegmentKey) -> Result<(), RepositoryError> {
        match self.segment(key) {
            Some(Segment::Memory { .. }) => {
                trace!("detaching memory segment {key:?}");
                self.materialize(key)
            }
            Some(_) => Err(RepositoryError::NotMemorySegment(key)),
            None => Err(RepositoryError::SegmentNotFound(key)),
        }
    }

    /// Detach every other memory segment sharing `[local_position, local_position + length)` of
    /// `key`'s range, so a write through `key` is not observed by them.
    pub fn detach_overlapping(
        &mut self,
        key: SegmentKey,
        local_position: u64,
        length: u64,
    ) -> Result<(), RepositoryError> {
        let Some(segment) = self.segment(key) else {
            return Err(RepositoryError::SegmentNotFound(key));
        };
        let Segment::Memory { source, start, .. } = segment else {
            return Err(RepositoryError::NotMemorySegment(key));
        };
        check_range(local_position, length, segment.length())?;

        let shared: Vec<SegmentKey> = self.sources[source]
            .index
            .overlapping(start + local_position, length)
            .into_iter()
            .map(|record| record.segment)
            .filter(|&other| other != key)
            .collect();
        for other in shared {
            self.detach_segment(other)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Documents
    // ---------------------------------------------------------------------

    /// Create an empty in-memory document.
    pub fn create_document(&mut self) -> DocumentId {
        self.documents.insert(DocumentData::new(None))
    }

    /// Create a document showing the whole content of a registered source.
    pub fn create_document_from(&mut self, source: SourceId) -> Result<DocumentId, RepositoryError> {
        let entry = self
            .sources
            .get(source)
            .ok_or(RepositoryError::SourceNotFound(source))?;
        if !entry.is_file() {
            return Err(RepositoryError::NotFileSource(source));
        }
        let length = entry.bytes().length();

        let mut data = DocumentData::new(Some(source));
        if length > 0 {
            let key = self.register_segment(Segment::Source {
                source,
                start: 0,
                length,
            });
            data.segments.push(key);
            data.length = length;
        }
        Ok(self.documents.insert(data))
    }

    /// Drop every segment of a document and forget it.
    pub fn dispose_document(&mut self, id: DocumentId) -> Result<(), RepositoryError> {
        let data = self
            .documents
            .remove(id)
            .ok_or(RepositoryError::DocumentNotFound(id))?;
        for key in data.segments {
            self.discard_segment(key);
        }
        if let Some(append) = data.append_source {
            self.hand_off_memory_source(append);
        }
        self.notify(RepositoryEvent {
            document: id,
            change: DocumentChange::Disposed,
            length: 0,
        });
        Ok(())
    }

    /// Access an open document.
    pub fn document(&mut self, id: DocumentId) -> Result<Document<'_>, RepositoryError> {
        if !self.documents.contains_key(id) {
            return Err(RepositoryError::DocumentNotFound(id));
        }
        Ok(Document::new(self, id))
    }

    /// Ids of all open documents.
    pub fn documents(&self) -> Vec<DocumentId> {
        self.documents.keys().collect()
    }

    /// Number of open documents.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Memory source receiving the bytes inserted into `id`, created on first use.
    pub(crate) fn append_source(&mut self, id: DocumentId) -> SourceId {
        if let Some(source) = self.documents[id].append_source
            && self.sources.contains_key(source)
        {
            return source;
        }
        let source = self
            .sources
            .insert(SourceEntry::memory(MemorySource::new(), false));
        self.documents[id].append_source = Some(source);
        source
    }

    /// Detach the append buffer from `id`. It is freed now if nothing reads from it, otherwise
    /// as soon as the last segment referencing it goes away.
    pub(crate) fn release_append_source(&mut self, id: DocumentId) {
        if let Some(append) = self.documents[id].append_source.take() {
            self.hand_off_memory_source(append);
        }
    }

    fn hand_off_memory_source(&mut self, id: SourceId) {
        if let Some(entry) = self.sources.get_mut(id)
            && let SourceStorage::Memory {
                release_when_unused,
                ..
            } = &mut entry.storage
        {
            *release_when_unused = true;
            self.release_if_unused(id);
        }
    }

    pub(crate) fn memory_source_mut(&mut self, id: SourceId) -> &mut MemorySource {
        match &mut self.sources[id].storage {
            SourceStorage::Memory { data, .. } => data,
            SourceStorage::File(_) => panic!("source {id:?} is not a memory source"),
        }
    }
}

/// Reject `[position, position + length)` reaching past `bound`.
pub(crate) fn check_range(position: u64, length: u64, bound: u64) -> Result<(), RepositoryError> {
    match position.checked_add(length) {
        Some(end) if end <= bound => Ok(()),
        _ => Err(RepositoryError::OutOfBounds {
            position,
            length,
            bound,
        }),
    }
}
