//! Documents: ordered segment sequences exposed as flat byte arrays.
//!
//! A document's content is the concatenation of its segments. Edits only touch the segment list:
//! inserting splits the segment at the insertion point and splices new segments in, removing
//! drops or trims the covered run, and overwriting writes memory segments in place (after
//! detaching aliasing copies) or swaps source segments for fresh memory segments.
//!
//! Position lookups go through a cached window `(segment index, start position)`. Resolving a
//! position walks from the window, so sequential access (painting, typing) costs the distance
//! moved instead of a scan from the start.
//!
//! The [`Document`] facade borrows the [`Repository`] mutably; open one with
//! [`Repository::document`].

use crate::error::{InvariantError, RepositoryError};
use crate::events::{DocumentChange, RepositoryEvent};
use crate::repository::{Repository, check_range};
use crate::segment::{Segment, SegmentKey};
use crate::source::{SourceId, to_index};
use std::io::{self, Read, Write};

slotmap::new_key_type! {
    /// Stable handle of a document owned by a [`Repository`].
    pub struct DocumentId;
}

/// Cached `(segment index, start position)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Window {
    pub(crate) index: usize,
    pub(crate) start: u64,
}

#[derive(Debug)]
pub(crate) struct DocumentData {
    pub(crate) segments: Vec<SegmentKey>,
    pub(crate) length: u64,
    pub(crate) origin: Option<SourceId>,
    /// Memory source receiving inserted bytes
    pub(crate) append_source: Option<SourceId>,
    pub(crate) window: Window,
}

impl DocumentData {
    pub(crate) fn new(origin: Option<SourceId>) -> Self {
        Self {
            segments: Vec::new(),
            length: 0,
            origin,
            append_source: None,
            window: Window::default(),
        }
    }
}

// -------------------------------------------------------------------------
// Segment list primitives
// -------------------------------------------------------------------------

impl Repository {
    /// Segment index containing `position` and that segment's start position.
    ///
    /// `position == length` resolves to `(segment count, length)`.
    pub(crate) fn locate(&mut self, id: DocumentId, position: u64) -> (usize, u64) {
        let segments = &self.segments;
        let data = &mut self.documents[id];
        let count = data.segments.len();

        let Window {
            mut index,
            mut start,
        } = data.window;
        if index > count {
            index = 0;
            start = 0;
        }

        loop {
            if position < start {
                index -= 1;
                start -= segments[data.segments[index]].length();
            } else if index < count {
                let length = segments[data.segments[index]].length();
                if position < start + length {
                    break;
                }
                start += length;
                index += 1;
            } else {
                break;
            }
        }

        data.window = Window { index, start };
        (index, start)
    }

    /// Make `position` a segment boundary and return the index of the segment starting there.
    pub(crate) fn split_at(&mut self, id: DocumentId, position: u64) -> usize {
        let (index, start) = self.locate(id, position);
        if position == start {
            return index;
        }

        let key = self.documents[id].segments[index];
        let right = self.split_segment(key, position - start);
        let data = &mut self.documents[id];
        data.segments.insert(index + 1, right);
        data.window = Window {
            index: index + 1,
            start: position,
        };
        index + 1
    }

    /// Merge segment `index` into its left neighbour if they reference contiguous bytes.
    pub(crate) fn try_merge(&mut self, id: DocumentId, index: usize) {
        let data = &self.documents[id];
        if index == 0 || index >= data.segments.len() {
            return;
        }
        let (left, right) = (data.segments[index - 1], data.segments[index]);
        let left_length = self.segments[left].length();
        let Some(merged) = self.segments[left].merged_with(&self.segments[right]) else {
            return;
        };

        self.discard_segment(right);
        self.replace_segment(left, merged);

        let data = &mut self.documents[id];
        data.segments.remove(index);
        if data.window.index > index {
            data.window.index -= 1;
        } else if data.window.index == index {
            data.window = Window {
                index: index - 1,
                start: data.window.start - left_length,
            };
        }
    }

    /// Splice already registered segments in at `position`.
    pub(crate) fn insert_keys(&mut self, id: DocumentId, position: u64, keys: Vec<SegmentKey>) {
        let added: u64 = keys.iter().map(|&key| self.segments[key].length()).sum();
        let count = keys.len();
        let index = self.split_at(id, position);

        let data = &mut self.documents[id];
        data.segments.splice(index..index, keys);
        data.length += added;
        data.window = Window {
            index,
            start: position,
        };

        self.try_merge(id, index + count);
        self.try_merge(id, index);
    }

    /// Store `bytes` in the document's append buffer and return a segment for them.
    fn append_bytes(&mut self, id: DocumentId, bytes: &[u8]) -> SegmentKey {
        let source = self.append_source(id);
        let start = self.memory_source_mut(source).append(bytes);
        self.register_segment(Segment::Memory {
            source,
            start,
            length: bytes.len() as u64,
        })
    }

    fn append_zeros(&mut self, id: DocumentId, count: u64) -> Result<SegmentKey, RepositoryError> {
        let source = self.append_source(id);
        let start = self.memory_source_mut(source).append_zeros(count)?;
        Ok(self.register_segment(Segment::Memory {
            source,
            start,
            length: count,
        }))
    }

    /// Copies of the segments covering `[position, position + length)`.
    pub(crate) fn copy_keys(
        &mut self,
        id: DocumentId,
        position: u64,
        length: u64,
    ) -> Vec<SegmentKey> {
        let mut keys = Vec::new();
        if length == 0 {
            return keys;
        }
        let (mut index, mut start) = self.locate(id, position);
        let end = position + length;
        let mut cursor = position;

        while cursor < end {
            let segment = self.segments[self.documents[id].segments[index]];
            let offset = cursor - start;
            let count = (segment.length() - offset).min(end - cursor);
            keys.push(self.register_segment(segment.slice(offset, count)));
            cursor += count;
            start += segment.length();
            index += 1;
        }
        keys
    }

    fn remove_range(&mut self, id: DocumentId, position: u64, length: u64) {
        if length == 0 {
            return;
        }
        let first = self.split_at(id, position);
        let last = self.split_at(id, position + length);

        let removed: Vec<SegmentKey> = self.documents[id].segments.drain(first..last).collect();
        for key in removed {
            self.discard_segment(key);
        }

        let data = &mut self.documents[id];
        data.length -= length;
        data.window = Window {
            index: first,
            start: position,
        };
        self.try_merge(id, first);
    }

    /// Overwrite `[position, position + data.len())`, which must lie inside the document.
    fn overwrite_range(
        &mut self,
        id: DocumentId,
        position: u64,
        bytes: &[u8],
    ) -> Result<(), RepositoryError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let first = self.split_at(id, position);
        let last = self.split_at(id, position + bytes.len() as u64);

        let mut offset = 0;
        for index in first..last {
            let key = self.documents[id].segments[index];
            let segment = self.segments[key];
            let count = segment.length() as usize;
            let chunk = &bytes[offset..offset + count];

            match segment {
                Segment::Memory { source, start, length } => {
                    self.detach_overlapping(key, 0, length)?;
                    self.sources[source].bytes_mut().write(start, chunk)?;
                }
                Segment::Source { .. } => {
                    let replacement = self.append_bytes(id, chunk);
                    self.discard_segment(key);
                    self.documents[id].segments[index] = replacement;
                }
                Segment::Space { .. } => panic!("space segment {key:?} found in document {id:?}"),
            }
            offset += count;
        }

        self.documents[id].window = Window {
            index: first,
            start: position,
        };
        for index in (first..=last).rev() {
            self.try_merge(id, index);
        }
        Ok(())
    }

    fn clear_segments(&mut self, id: DocumentId) {
        let data = &mut self.documents[id];
        let keys = std::mem::take(&mut data.segments);
        data.length = 0;
        data.window = Window::default();
        for key in keys {
            self.discard_segment(key);
        }
        self.release_append_source(id);
    }

    fn read_range(
        &mut self,
        id: DocumentId,
        position: u64,
        buffer: &mut [u8],
    ) -> Result<(), RepositoryError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let (mut index, mut start) = self.locate(id, position);
        let mut done = 0;

        while done < buffer.len() {
            let segment = self.segments[self.documents[id].segments[index]];
            let offset = position + done as u64 - start;
            let count = (segment.length() - offset).min((buffer.len() - done) as u64) as usize;
            self.read_segment(&segment, offset, &mut buffer[done..done + count])?;
            done += count;
            start += segment.length();
            index += 1;
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Facade
// -------------------------------------------------------------------------

/// Byte-level view of one document, borrowing the owning [`Repository`].
pub struct Document<'a> {
    repository: &'a mut Repository,
    id: DocumentId,
}

impl std::fmt::Debug for Document<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("length", &self.length())
            .field("segments", &self.segment_count())
            .finish()
    }
}

impl<'a> Document<'a> {
    pub(crate) fn new(repository: &'a mut Repository, id: DocumentId) -> Self {
        Self { repository, id }
    }

    fn data(&self) -> &DocumentData {
        &self.repository.documents[self.id]
    }

    fn notify(&mut self, change: DocumentChange) {
        let length = self.length();
        self.repository.notify(RepositoryEvent {
            document: self.id,
            change,
            length,
        });
    }

    /// Id of this document.
    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Logical length in bytes.
    pub fn length(&self) -> u64 {
        self.data().length
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Source this document was opened from and saves to.
    pub fn origin(&self) -> Option<SourceId> {
        self.data().origin
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.data().segments.len()
    }

    /// Segment keys in document order.
    pub fn segment_keys(&self) -> &[SegmentKey] {
        &self.data().segments
    }

    /// Segments in document order.
    pub fn segments(&self) -> Vec<Segment> {
        self.data()
            .segments
            .iter()
            .map(|&key| self.repository.segments[key])
            .collect()
    }

    /// The segment covering `position`, `None` at or after the end.
    pub fn segment_at(&mut self, position: u64) -> Option<(SegmentKey, Segment)> {
        if position >= self.length() {
            return None;
        }
        let (index, _) = self.repository.locate(self.id, position);
        let key = self.data().segments[index];
        Some((key, self.repository.segments[key]))
    }

    /// Read one byte.
    pub fn get_byte(&mut self, position: u64) -> Result<u8, RepositoryError> {
        check_range(position, 1, self.length())?;
        let mut byte = [0];
        self.repository.read_range(self.id, position, &mut byte)?;
        Ok(byte[0])
    }

    /// Overwrite one byte.
    pub fn set_byte(&mut self, position: u64, value: u8) -> Result<(), RepositoryError> {
        check_range(position, 1, self.length())?;
        self.repository.overwrite_range(self.id, position, &[value])?;
        self.notify(DocumentChange::Overwritten {
            position,
            length: 1,
        });
        Ok(())
    }

    /// Fill `buffer` with the bytes starting at `position`.
    pub fn copy_to_slice(&mut self, position: u64, buffer: &mut [u8]) -> Result<(), RepositoryError> {
        check_range(position, buffer.len() as u64, self.length())?;
        self.repository.read_range(self.id, position, buffer)
    }

    /// Whole content as a vector.
    pub fn read_all(&mut self) -> Result<Vec<u8>, RepositoryError> {
        let mut buffer = vec![0; to_index(self.length())?];
        self.repository.read_range(self.id, 0, &mut buffer)?;
        Ok(buffer)
    }

    /// Insert bytes at `position`.
    pub fn insert(&mut self, position: u64, data: &[u8]) -> Result<(), RepositoryError> {
        check_range(position, 0, self.length())?;
        if data.is_empty() {
            return Ok(());
        }
        let key = self.repository.append_bytes(self.id, data);
        self.repository.insert_keys(self.id, position, vec![key]);
        self.notify(DocumentChange::Inserted {
            position,
            length: data.len() as u64,
        });
        Ok(())
    }

    /// Insert `count` zero bytes at `position`.
    pub fn insert_zeros(&mut self, position: u64, count: u64) -> Result<(), RepositoryError> {
        check_range(position, 0, self.length())?;
        if count == 0 {
            return Ok(());
        }
        let key = self.repository.append_zeros(self.id, count)?;
        self.repository.insert_keys(self.id, position, vec![key]);
        self.notify(DocumentChange::Inserted {
            position,
            length: count,
        });
        Ok(())
    }

    /// Insert `[source_position, source_position + length)` of `source` (possibly this document)
    /// at `position`. Segments are shared, not copied.
    pub fn insert_document(
        &mut self,
        position: u64,
        source: DocumentId,
        source_position: u64,
        length: u64,
    ) -> Result<(), RepositoryError> {
        check_range(position, 0, self.length())?;
        let source_length = self
            .repository
            .documents
            .get(source)
            .ok_or(RepositoryError::DocumentNotFound(source))?
            .length;
        check_range(source_position, length, source_length)?;
        if length == 0 {
            return Ok(());
        }

        let keys = self.repository.copy_keys(source, source_position, length);
        self.repository.insert_keys(self.id, position, keys);
        self.notify(DocumentChange::Inserted { position, length });
        Ok(())
    }

    /// Splice a registered segment that belongs to no document in at `position`.
    ///
    /// The document takes the segment over. A zero-length segment is dropped instead of spliced.
    pub fn insert_segment(&mut self, position: u64, key: SegmentKey) -> Result<(), RepositoryError> {
        check_range(position, 0, self.length())?;
        let segment = self.repository.claim_segment(key)?;
        if segment.length() == 0 {
            self.repository.discard_segment(key);
            return Ok(());
        }
        self.repository.insert_keys(self.id, position, vec![key]);
        self.notify(DocumentChange::Inserted {
            position,
            length: segment.length(),
        });
        Ok(())
    }

    /// Remove `length` bytes starting at `position`.
    pub fn remove(&mut self, position: u64, length: u64) -> Result<(), RepositoryError> {
        check_range(position, length, self.length())?;
        if length == 0 {
            return Ok(());
        }
        self.repository.remove_range(self.id, position, length);
        self.notify(DocumentChange::Removed { position, length });
        Ok(())
    }

    /// Overwrite bytes from `position`, growing the document if `data` reaches past its end.
    pub fn replace(&mut self, position: u64, data: &[u8]) -> Result<(), RepositoryError> {
        check_range(position, 0, self.length())?;
        let in_place = (self.length() - position).min(data.len() as u64) as usize;
        self.repository
            .overwrite_range(self.id, position, &data[..in_place])?;
        if in_place < data.len() {
            let key = self.repository.append_bytes(self.id, &data[in_place..]);
            let end = self.length();
            self.repository.insert_keys(self.id, end, vec![key]);
        }
        self.notify(DocumentChange::Overwritten {
            position,
            length: data.len() as u64,
        });
        Ok(())
    }

    /// Overwrite `[position, position + length)` with `fill`.
    ///
    /// Only a zero fill byte is supported.
    pub fn fill_data(&mut self, position: u64, length: u64, fill: u8) -> Result<(), RepositoryError> {
        if fill != 0 {
            return Err(RepositoryError::UnsupportedFill(fill));
        }
        check_range(position, length, self.length())?;
        if length == 0 {
            return Ok(());
        }
        self.repository.remove_range(self.id, position, length);
        let key = self.repository.append_zeros(self.id, length)?;
        self.repository.insert_keys(self.id, position, vec![key]);
        self.notify(DocumentChange::Overwritten { position, length });
        Ok(())
    }

    /// Truncate, or extend with zero bytes, to `length`.
    pub fn set_length(&mut self, length: u64) -> Result<(), RepositoryError> {
        let current = self.length();
        if length < current {
            self.remove(length, current - length)
        } else {
            self.insert_zeros(current, length - current)
        }
    }

    /// Drop all content.
    pub fn clear(&mut self) {
        self.repository.clear_segments(self.id);
        self.notify(DocumentChange::Cleared);
    }

    /// Independent in-memory document with the same content.
    pub fn copy(&mut self) -> Result<DocumentId, RepositoryError> {
        let length = self.length();
        self.copy_range(0, length)
    }

    /// Independent in-memory document holding `[position, position + length)`.
    ///
    /// The copy shares segments' bytes; memory bytes are detached on the first write through
    /// either side.
    pub fn copy_range(&mut self, position: u64, length: u64) -> Result<DocumentId, RepositoryError> {
        check_range(position, length, self.length())?;
        let keys = self.repository.copy_keys(self.id, position, length);
        let copy = self.repository.create_document();
        let data = &mut self.repository.documents[copy];
        data.segments = keys;
        data.length = length;
        Ok(copy)
    }

    /// Replace the content with everything `reader` yields.
    ///
    /// Returns the number of bytes loaded.
    pub fn load_from_reader<R: Read>(&mut self, mut reader: R) -> Result<u64, RepositoryError> {
        self.repository.clear_segments(self.id);
        let mut buffer = vec![0; self.repository.config.buffer_size];
        loop {
            let count = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            let key = self.repository.append_bytes(self.id, &buffer[..count]);
            let end = self.length();
            self.repository.insert_keys(self.id, end, vec![key]);
        }
        self.notify(DocumentChange::Loaded);
        Ok(self.length())
    }

    /// Stream the whole content into `writer`.
    pub fn save_to_writer<W: Write>(&mut self, mut writer: W) -> Result<(), RepositoryError> {
        let length = self.length();
        let mut buffer = vec![0; self.repository.config.buffer_size];
        let mut position = 0;
        while position < length {
            let count = (length - position).min(buffer.len() as u64) as usize;
            self.repository
                .read_range(self.id, position, &mut buffer[..count])?;
            writer.write_all(&buffer[..count])?;
            position += count as u64;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the content back into the origin source.
    pub fn save(&mut self) -> Result<(), RepositoryError> {
        self.repository.save_document(self.id)
    }

    /// Check the length invariant and the position window.
    pub fn validate(&self) -> Result<(), InvariantError> {
        let data = self.data();
        let segments = &self.repository.segments;

        let actual: u64 = data.segments.iter().map(|&key| segments[key].length()).sum();
        if actual != data.length {
            return Err(InvariantError::LengthMismatch {
                recorded: data.length,
                actual,
            });
        }

        let window = data.window;
        if window.index <= data.segments.len() {
            let start: u64 = data.segments[..window.index]
                .iter()
                .map(|&key| segments[key].length())
                .sum();
            if start != window.start {
                return Err(InvariantError::WindowMismatch {
                    index: window.index,
                    cached: window.start,
                    actual: start,
                });
            }
        }
        Ok(())
    }
}
