//! Writing a document back into the source it was opened from.
//!
//! The document's segments may read from the very file they are written to, in any order and
//! with arbitrary overlaps, and other open documents may reference the same file. Saving runs in
//! these phases:
//!
//! 1. **Transformation**: assign every segment its target position (prefix sum of lengths).
//! 2. **Sibling propagation**: re-point the other documents' segments on the file at the
//!    positions their bytes will occupy after the save; bytes that will not survive are
//!    preloaded into memory first.
//! 3. **Independent flush**: write every segment whose target range does not cover bytes a
//!    pending segment still has to read. Segments already in place are not written at all.
//!    Each flush releases the segments it was blocking, which are retried from a worklist.
//! 4. **Chunked flush**: what is left forms overlap cycles. Walk it left to right in bounded
//!    chunks; before writing a chunk, preload every pending range its target covers.
//! 5. **Finalize**: the document becomes one segment spanning the whole file.
//!
//! A flushed segment is turned into a [`Segment::Space`] placeholder, which drops it from the
//! file's segment index. Pending segments are therefore exactly the index records that belong
//! to the transformation, and a range referenced by a pending record is never overwritten before
//! that record is flushed or preloaded.

use crate::document::{DocumentId, Window};
use crate::error::RepositoryError;
use crate::events::{DocumentChange, RepositoryEvent};
use crate::repository::Repository;
use crate::segment::{Segment, SegmentKey};
use crate::segment_index::IndexRecord;
use crate::source::{SourceId, to_index};
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Target positions of the segments of the document being saved.
struct SaveTransformation {
    document: DocumentId,
    origin: SourceId,
    targets: HashMap<SegmentKey, u64>,
    length: u64,
    stats: SaveStats,
}

#[derive(Debug, Default)]
struct SaveStats {
    in_place: usize,
    written: usize,
    reversed: usize,
    preloaded_bytes: u64,
    relocated_siblings: usize,
}

impl SaveTransformation {
    fn target(&self, key: SegmentKey) -> u64 {
        match self.targets.get(&key) {
            Some(&target) => target,
            None => panic!("segment {key:?} missing from save transformation"),
        }
    }

    fn is_pending(&self, key: SegmentKey) -> bool {
        self.targets.contains_key(&key)
    }
}

/// Segment list replacing a sibling document's list once all siblings are planned.
struct SiblingPlan {
    document: DocumentId,
    segments: Vec<SegmentKey>,
    replaced: Vec<SegmentKey>,
}

/// Where a piece of a sibling's source range ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relocation {
    /// The bytes will be at `target` after the save.
    Mapped { target: u64, length: u64 },
    /// The bytes will be overwritten; copy them from `start` now.
    Preload { start: u64, length: u64 },
}

impl Repository {
    /// Persist a document's content into its origin source.
    ///
    /// Afterwards the document consists of a single source segment covering the whole origin,
    /// and other documents referencing the origin still show their previous content.
    ///
    /// An I/O error part way through leaves the origin in an unspecified intermediate state.
    pub fn save_document(&mut self, id: DocumentId) -> Result<(), RepositoryError> {
        let data = self
            .documents
            .get(id)
            .ok_or(RepositoryError::DocumentNotFound(id))?;
        let origin = data.origin.ok_or(RepositoryError::NoOrigin(id))?;
        match self.sources.get(origin) {
            Some(entry) if entry.is_file() => {}
            Some(_) => return Err(RepositoryError::NotFileSource(origin)),
            None => return Err(RepositoryError::SourceNotFound(origin)),
        }

        let mut transformation = self.compute_save_transformation(id, origin);
        debug!(
            "saving document {id:?}: {} segments, {} bytes",
            transformation.targets.len(),
            transformation.length
        );

        self.propagate_to_siblings(&mut transformation)?;
        self.flush_independent(&mut transformation)?;
        self.flush_in_chunks(&mut transformation)?;
        self.finalize_save(&transformation)?;

        let stats = &transformation.stats;
        debug!(
            "saved document {id:?}: {} in place, {} written ({} reversed), {} bytes preloaded, {} siblings relocated",
            stats.in_place,
            stats.written,
            stats.reversed,
            stats.preloaded_bytes,
            stats.relocated_siblings
        );
        let length = transformation.length;
        self.notify(RepositoryEvent {
            document: id,
            change: DocumentChange::Saved,
            length,
        });
        Ok(())
    }

    fn compute_save_transformation(&self, id: DocumentId, origin: SourceId) -> SaveTransformation {
        let mut targets = HashMap::new();
        let mut position = 0;
        for &key in &self.documents[id].segments {
            targets.insert(key, position);
            position += self.segments[key].length();
        }
        SaveTransformation {
            document: id,
            origin,
            targets,
            length: position,
            stats: SaveStats::default(),
        }
    }

    /// Pending records of the saved document reading from `[start, start + length)` of the origin.
    fn pending_overlaps(
        &mut self,
        transformation: &SaveTransformation,
        start: u64,
        length: u64,
    ) -> Vec<IndexRecord> {
        self.sources[transformation.origin]
            .index
            .overlapping(start, length)
            .into_iter()
            .filter(|record| transformation.is_pending(record.segment))
            .collect()
    }

    /// Split `[start, start + length)` of the origin into ranges covered by pending segments
    /// (which will be found at their target) and uncovered ranges.
    fn relocate(
        &mut self,
        transformation: &SaveTransformation,
        start: u64,
        length: u64,
    ) -> Vec<Relocation> {
        let records = self.pending_overlaps(transformation, start, length);
        let end = start + length;
        let mut pieces: Vec<Relocation> = Vec::new();
        let mut position = start;

        while position < end {
            let cover = records
                .iter()
                .filter(|r| r.start <= position && position < r.end())
                .max_by_key(|r| r.end());

            match cover {
                Some(record) => {
                    let piece_end = record.end().min(end);
                    let target = transformation.target(record.segment) + (position - record.start);
                    let piece_length = piece_end - position;
                    if let Some(Relocation::Mapped {
                        target: last_target,
                        length: last_length,
                    }) = pieces.last_mut()
                        && *last_target + *last_length == target
                    {
                        *last_length += piece_length;
                    } else {
                        pieces.push(Relocation::Mapped {
                            target,
                            length: piece_length,
                        });
                    }
                    position = piece_end;
                }
                None => {
                    let next = records
                        .iter()
                        .map(|r| r.start)
                        .filter(|&s| s > position)
                        .min()
                        .unwrap_or(end)
                        .min(end);
                    pieces.push(Relocation::Preload {
                        start: position,
                        length: next - position,
                    });
                    position = next;
                }
            }
        }
        pieces
    }

    /// Copy `[start, start + length)` of a source into a new private memory segment.
    fn preload_range(
        &mut self,
        source: SourceId,
        start: u64,
        length: u64,
    ) -> Result<SegmentKey, RepositoryError> {
        let mut bytes = vec![0; to_index(length)?];
        self.sources[source]
            .bytes_mut()
            .read_fully(start, &mut bytes)?;
        let memory = self.open_private_memory_source(bytes);
        Ok(self.register_segment(Segment::Memory {
            source: memory,
            start: 0,
            length,
        }))
    }

    fn propagate_to_siblings(
        &mut self,
        transformation: &mut SaveTransformation,
    ) -> Result<(), RepositoryError> {
        let siblings: Vec<DocumentId> = self
            .documents
            .keys()
            .filter(|&other| other != transformation.document)
            .collect();

        // Nothing is committed until every sibling is planned, so a failed preload leaves all
        // documents as they were.
        let mut fresh = Vec::new();
        let mut plans = Vec::new();
        for sibling in siblings {
            match self.plan_relocation(transformation, sibling, &mut fresh) {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => {}
                Err(err) => {
                    for key in fresh {
                        self.discard_segment(key);
                    }
                    return Err(err);
                }
            }
        }

        for plan in plans {
            trace!("relocated segments of sibling document {:?}", plan.document);
            transformation.stats.relocated_siblings += 1;
            for key in plan.replaced {
                self.discard_segment(key);
            }
            let data = &mut self.documents[plan.document];
            data.segments = plan.segments;
            data.window = Window::default();
        }
        Ok(())
    }

    /// New segment list for `sibling`, or `None` when none of its segments move.
    ///
    /// Every segment registered here is also pushed to `fresh`.
    fn plan_relocation(
        &mut self,
        transformation: &mut SaveTransformation,
        sibling: DocumentId,
        fresh: &mut Vec<SegmentKey>,
    ) -> Result<Option<SiblingPlan>, RepositoryError> {
        let origin = transformation.origin;
        let old = self.documents[sibling].segments.clone();
        let mut segments = Vec::with_capacity(old.len());
        let mut replaced = Vec::new();

        for key in old {
            let Segment::Source {
                source,
                start,
                length,
            } = self.segments[key]
            else {
                segments.push(key);
                continue;
            };
            if source != origin {
                segments.push(key);
                continue;
            }

            let pieces = self.relocate(transformation, start, length);
            if let [Relocation::Mapped { target, .. }] = pieces.as_slice()
                && *target == start
            {
                segments.push(key);
                continue;
            }

            for piece in pieces {
                let replacement = match piece {
                    Relocation::Mapped { target, length } => {
                        self.register_segment(Segment::Source {
                            source: origin,
                            start: target,
                            length,
                        })
                    }
                    Relocation::Preload { start, length } => {
                        transformation.stats.preloaded_bytes += length;
                        self.preload_range(origin, start, length)?
                    }
                };
                fresh.push(replacement);
                segments.push(replacement);
            }
            replaced.push(key);
        }

        if replaced.is_empty() {
            return Ok(None);
        }
        Ok(Some(SiblingPlan {
            document: sibling,
            segments,
            replaced,
        }))
    }

    fn is_in_place(&self, transformation: &SaveTransformation, key: SegmentKey) -> bool {
        matches!(
            self.segments[key],
            Segment::Source { source, start, .. }
                if source == transformation.origin && start == transformation.target(key)
        )
    }

    /// A pending segment, other than `key`, still reading bytes `key` would overwrite.
    fn find_blocker(
        &mut self,
        transformation: &SaveTransformation,
        key: SegmentKey,
    ) -> Option<SegmentKey> {
        if self.is_in_place(transformation, key) {
            return None;
        }
        let target = transformation.target(key);
        let length = self.segments[key].length();
        self.pending_overlaps(transformation, target, length)
            .into_iter()
            .map(|record| record.segment)
            .find(|&other| other != key)
    }

    fn flush_independent(
        &mut self,
        transformation: &mut SaveTransformation,
    ) -> Result<(), RepositoryError> {
        let mut work: VecDeque<SegmentKey> = self.documents[transformation.document]
            .segments
            .iter()
            .copied()
            .collect();
        let mut blocked: HashMap<SegmentKey, Vec<SegmentKey>> = HashMap::new();

        while let Some(key) = work.pop_front() {
            if self.segments[key].is_space() {
                continue;
            }
            if let Some(blocker) = self.find_blocker(transformation, key) {
                trace!("segment {key:?} waits for {blocker:?}");
                blocked.entry(blocker).or_default().push(key);
                continue;
            }

            self.flush_segment(transformation, key)?;
            if let Some(released) = blocked.remove(&key) {
                for waiting in released.into_iter().rev() {
                    work.push_front(waiting);
                }
            }
        }

        debug!(
            "independent flush done, {} segments blocked in cycles",
            blocked.values().map(Vec::len).sum::<usize>()
        );
        Ok(())
    }

    fn flush_in_chunks(
        &mut self,
        transformation: &mut SaveTransformation,
    ) -> Result<(), RepositoryError> {
        let chunk = self.config.save_chunk_size.max(1);
        let mut queue: BTreeSet<(u64, SegmentKey)> = self.documents[transformation.document]
            .segments
            .iter()
            .filter(|&&key| !self.segments[key].is_space())
            .map(|&key| (transformation.target(key), key))
            .collect();

        // Target order is document order; split pieces join the queue at their own target.
        while let Some((target, key)) = queue.pop_first() {
            if self.segments[key].length() > chunk {
                let tail = self.split_segment(key, chunk);
                transformation.targets.insert(tail, target + chunk);
                queue.insert((target + chunk, tail));
            }

            self.preload_conflicts(transformation, &mut queue, key)?;
            self.flush_segment(transformation, key)?;
        }
        Ok(())
    }

    /// Preload every pending range that writing `key` would overwrite.
    fn preload_conflicts(
        &mut self,
        transformation: &mut SaveTransformation,
        queue: &mut BTreeSet<(u64, SegmentKey)>,
        key: SegmentKey,
    ) -> Result<(), RepositoryError> {
        if self.is_in_place(transformation, key) {
            return Ok(());
        }
        let target = transformation.target(key);
        let length = self.segments[key].length();

        // Each round turns one overlapping range into memory, so the loop drains.
        loop {
            let conflict = self
                .pending_overlaps(transformation, target, length)
                .into_iter()
                .find(|record| record.segment != key);
            let Some(record) = conflict else {
                return Ok(());
            };
            self.preload_overlap(transformation, queue, record, target, length)?;
        }
    }

    /// Split `record`'s segment so the part reading `[target, target + length)` stands alone,
    /// then move that part into memory.
    fn preload_overlap(
        &mut self,
        transformation: &mut SaveTransformation,
        queue: &mut BTreeSet<(u64, SegmentKey)>,
        record: IndexRecord,
        target: u64,
        length: u64,
    ) -> Result<(), RepositoryError> {
        let from = record.start.max(target);
        let to = record.end().min(target + length);

        let mut key = record.segment;
        if from > record.start {
            let tail = self.split_segment(key, from - record.start);
            let tail_target = transformation.target(key) + (from - record.start);
            transformation.targets.insert(tail, tail_target);
            queue.insert((tail_target, tail));
            key = tail;
        }
        if to < record.end() {
            let tail = self.split_segment(key, to - from);
            let tail_target = transformation.target(key) + (to - from);
            transformation.targets.insert(tail, tail_target);
            queue.insert((tail_target, tail));
        }

        trace!("preloading {from}..{to} of the origin for {key:?}");
        transformation.stats.preloaded_bytes += to - from;
        self.materialize(key)
    }

    /// Write one segment to its target and turn it into a space placeholder.
    fn flush_segment(
        &mut self,
        transformation: &mut SaveTransformation,
        key: SegmentKey,
    ) -> Result<(), RepositoryError> {
        let segment = self.segments[key];
        let target = transformation.target(key);

        if self.is_in_place(transformation, key) {
            transformation.stats.in_place += 1;
        } else {
            trace!("flushing {segment:?} to {target}");
            self.write_to_origin(transformation, &segment, target)?;
            transformation.stats.written += 1;
        }

        self.replace_segment(
            key,
            Segment::Space {
                length: segment.length(),
            },
        );
        Ok(())
    }

    fn write_to_origin(
        &mut self,
        transformation: &mut SaveTransformation,
        segment: &Segment,
        target: u64,
    ) -> Result<(), RepositoryError> {
        let origin = transformation.origin;
        match *segment {
            Segment::Source {
                source,
                start,
                length,
            } if source == origin => {
                // Moving right over its own bytes: copy back to front.
                let reverse = start < target && target < start + length;
                if reverse {
                    transformation.stats.reversed += 1;
                }
                self.copy_blocks(source, start, origin, target, length, reverse)
            }
            Segment::Source {
                source,
                start,
                length,
            }
            | Segment::Memory {
                source,
                start,
                length,
            } => self.copy_blocks(source, start, origin, target, length, false),
            Segment::Space { .. } => panic!("space segment scheduled for writing"),
        }
    }

    /// Stream `length` bytes between sources in `buffer_size` blocks.
    fn copy_blocks(
        &mut self,
        from: SourceId,
        from_start: u64,
        to: SourceId,
        to_start: u64,
        length: u64,
        reverse: bool,
    ) -> Result<(), RepositoryError> {
        let block = self.config.buffer_size.max(1) as u64;
        let mut buffer = vec![0; block.min(length) as usize];
        let mut done = 0;

        while done < length {
            let count = block.min(length - done);
            let offset = if reverse { length - done - count } else { done };
            let chunk = &mut buffer[..count as usize];
            self.sources[from]
                .bytes_mut()
                .read_fully(from_start + offset, chunk)?;
            self.sources[to].bytes_mut().write(to_start + offset, chunk)?;
            done += count;
        }
        Ok(())
    }

    fn finalize_save(&mut self, transformation: &SaveTransformation) -> Result<(), RepositoryError> {
        let document = transformation.document;
        let origin = transformation.origin;
        let length = transformation.length;

        // Split pieces never enter the document list, but all of them carry a target.
        self.documents[document].segments.clear();
        for &key in transformation.targets.keys() {
            self.discard_segment(key);
        }

        let bytes = self.sources[origin].bytes_mut();
        bytes.set_length(length)?;
        bytes.clear_cache();

        let segments = if length > 0 {
            vec![self.register_segment(Segment::Source {
                source: origin,
                start: 0,
                length,
            })]
        } else {
            Vec::new()
        };

        let data = &mut self.documents[document];
        data.segments = segments;
        data.length = length;
        data.window = Window::default();
        self.release_append_source(document);
        Ok(())
    }
}
