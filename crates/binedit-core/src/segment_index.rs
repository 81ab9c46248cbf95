//! Per-source registry of live segments.
//!
//! Every source owns one [`SegmentIndex`] listing the segments that reference it, sorted by
//! `(start, length)`. It answers "which segments read this byte range?", which is what the save
//! algorithm needs to decide whether writing a range would destroy bytes another segment still
//! depends on, and what copy-on-write detaching needs to find aliasing memory segments.
//!
//! The records are kept in a sorted vector with a parallel prefix-maximum of end positions:
//! `max_end[i] = max(records[0..=i].end)`. An overlap query scans backward from the first record
//! starting after the queried range and stops as soon as `max_end` proves nothing further left
//! can reach the range.
//!
//! A movable focus remembers the last visited position. Lookups walk from the focus for a short
//! distance before falling back to binary search, so an editor touching nearby positions pays
//! for the distance moved rather than for the index size.

use crate::error::InvariantError;
use crate::segment::SegmentKey;

/// How far a lookup walks from the focus before switching to binary search.
const FOCUS_WALK_LIMIT: usize = 32;

/// One live segment's range in the indexed source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Start position in the source.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    /// Segment owning this range.
    pub segment: SegmentKey,
}

impl IndexRecord {
    /// Exclusive end position.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Whether this record intersects `[start, start + length)`.
    pub fn overlaps(&self, start: u64, length: u64) -> bool {
        length > 0 && self.length > 0 && self.start < start + length && start < self.end()
    }

    fn key(&self) -> (u64, u64, SegmentKey) {
        (self.start, self.length, self.segment)
    }
}

/// Ordered registry of the segments referencing one source.
#[derive(Debug, Default)]
pub struct SegmentIndex {
    /// Records sorted by `(start, length, segment)`
    records: Vec<IndexRecord>,
    /// Prefix maximum end position: `max_end[i] = max(records[0..=i].end)`
    max_end: Vec<u64>,
    focus: usize,
}

impl SegmentIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at `index`, in `(start, length)` order.
    pub fn record(&self, index: usize) -> Option<&IndexRecord> {
        self.records.get(index)
    }

    /// All records in `(start, length)` order.
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// First index whose record does not satisfy `is_before`, walking from the focus.
    fn lower_bound(&mut self, is_before: impl Fn(&IndexRecord) -> bool) -> usize {
        let len = self.records.len();
        let mut idx = self.focus.min(len);
        let mut steps = 0;

        if idx > 0 && !is_before(&self.records[idx - 1]) {
            while idx > 0 && !is_before(&self.records[idx - 1]) {
                idx -= 1;
                steps += 1;
                if steps > FOCUS_WALK_LIMIT {
                    idx = self.records.partition_point(|r| is_before(r));
                    break;
                }
            }
        } else {
            while idx < len && is_before(&self.records[idx]) {
                idx += 1;
                steps += 1;
                if steps > FOCUS_WALK_LIMIT {
                    idx = self.records.partition_point(|r| is_before(r));
                    break;
                }
            }
        }

        self.focus = idx;
        idx
    }

    fn find(&mut self, record: &IndexRecord) -> Result<usize, usize> {
        let key = record.key();
        let idx = self.lower_bound(|r| r.key() < key);
        match self.records.get(idx) {
            Some(found) if found.key() == key => Ok(idx),
            _ => Err(idx),
        }
    }

    /// Register `segment` as reading `[start, start + length)`.
    ///
    /// Panics if the exact record is already present.
    pub fn add(&mut self, segment: SegmentKey, start: u64, length: u64) {
        let record = IndexRecord {
            start,
            length,
            segment,
        };
        let pos = match self.find(&record) {
            Ok(_) => panic!("segment {segment:?} registered twice at {start}+{length}"),
            Err(pos) => pos,
        };

        let left = if pos == 0 { 0 } else { self.max_end[pos - 1] };
        let running = left.max(record.end());
        self.records.insert(pos, record);
        self.max_end.insert(pos, running);

        // Prefix maxima to the right only change until one already reaches `running`.
        for value in self.max_end.iter_mut().skip(pos + 1) {
            if *value >= running {
                break;
            }
            *value = running;
        }
    }

    /// Unregister `segment` reading `[start, start + length)`.
    ///
    /// Panics if the record is missing, which means segment bookkeeping is corrupted.
    pub fn remove(&mut self, segment: SegmentKey, start: u64, length: u64) {
        let record = IndexRecord {
            start,
            length,
            segment,
        };
        let pos = match self.find(&record) {
            Ok(pos) => pos,
            Err(_) => panic!("segment {segment:?} missing from index at {start}+{length}"),
        };

        self.records.remove(pos);
        self.max_end.remove(pos);
        self.repair_from(pos);
    }

    /// Move a record to a new range.
    pub fn update(
        &mut self,
        segment: SegmentKey,
        old: (u64, u64),
        start: u64,
        length: u64,
    ) {
        self.remove(segment, old.0, old.1);
        self.add(segment, start, length);
    }

    fn repair_from(&mut self, pos: usize) {
        let mut running = if pos == 0 { 0 } else { self.max_end[pos - 1] };
        for idx in pos..self.records.len() {
            let value = running.max(self.records[idx].end());
            if value == self.max_end[idx] {
                break;
            }
            self.max_end[idx] = value;
            running = value;
        }
    }

    /// Position of some record intersecting `[start, start + length)`.
    ///
    /// The returned record is not necessarily the leftmost one; walk neighbours with
    /// [`SegmentIndex::record`] or use [`SegmentIndex::overlapping`] to enumerate all of them.
    pub fn find_first_overlap(&mut self, start: u64, length: u64) -> Option<usize> {
        if length == 0 {
            return None;
        }
        let end = start + length;
        let mut idx = self.lower_bound(|r| r.start < end);

        while idx > 0 {
            idx -= 1;
            if self.max_end[idx] <= start {
                return None;
            }
            if self.records[idx].overlaps(start, length) {
                self.focus = idx;
                return Some(idx);
            }
        }
        None
    }

    /// All records intersecting `[start, start + length)`, in index order.
    pub fn overlapping(&mut self, start: u64, length: u64) -> Vec<IndexRecord> {
        let Some(found) = self.find_first_overlap(start, length) else {
            return Vec::new();
        };
        let end = start + length;

        let mut first = found;
        while first > 0 && self.max_end[first - 1] > start {
            first -= 1;
        }

        let mut result = Vec::new();
        for record in &self.records[first..] {
            if record.start >= end {
                break;
            }
            if record.overlaps(start, length) {
                result.push(*record);
            }
        }
        result
    }

    /// Check ordering and the `max_end` cache.
    pub fn validate(&self) -> Result<(), InvariantError> {
        let mut running = 0;
        for (idx, record) in self.records.iter().enumerate() {
            if idx > 0 && self.records[idx - 1].key() >= record.key() {
                return Err(InvariantError::IndexOrder(idx));
            }
            running = running.max(record.end());
            if self.max_end[idx] != running {
                return Err(InvariantError::IndexMaxEnd(idx));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use slotmap::SlotMap;

    fn keys(count: usize) -> Vec<SegmentKey> {
        let mut map: SlotMap<SegmentKey, ()> = SlotMap::with_key();
        (0..count).map(|_| map.insert(())).collect()
    }

    #[test]
    fn test_add_remove_keeps_order_and_cache() {
        let k = keys(4);
        let mut index = SegmentIndex::new();
        index.add(k[0], 10, 5);
        index.add(k[1], 0, 30);
        index.add(k[2], 20, 2);
        index.add(k[3], 5, 1);
        index.validate().unwrap();

        let starts: Vec<u64> = index.records().iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0, 5, 10, 20]);

        index.remove(k[1], 0, 30);
        index.validate().unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.find_first_overlap(25, 5), None);
    }

    #[test]
    fn test_overlap_finds_long_record_far_left() {
        let k = keys(3);
        let mut index = SegmentIndex::new();
        index.add(k[0], 0, 100);
        index.add(k[1], 10, 1);
        index.add(k[2], 20, 1);

        let found = index.find_first_overlap(50, 10).unwrap();
        assert_eq!(index.record(found).unwrap().segment, k[0]);

        let all = index.overlapping(15, 10);
        let segments: Vec<SegmentKey> = all.iter().map(|r| r.segment).collect();
        assert_eq!(segments, vec![k[0], k[2]]);
    }

    #[test]
    fn test_zero_length_query_finds_nothing() {
        let k = keys(1);
        let mut index = SegmentIndex::new();
        index.add(k[0], 0, 10);
        assert_eq!(index.find_first_overlap(5, 0), None);
    }

    #[test]
    fn test_update_moves_record() {
        let k = keys(2);
        let mut index = SegmentIndex::new();
        index.add(k[0], 0, 4);
        index.add(k[1], 4, 4);
        index.update(k[0], (0, 4), 100, 4);
        index.validate().unwrap();
        assert!(index.overlapping(0, 4).is_empty());
        assert_eq!(index.overlapping(100, 1)[0].segment, k[0]);
    }

    #[test]
    #[should_panic(expected = "missing from index")]
    fn test_remove_unknown_record_panics() {
        let k = keys(1);
        let mut index = SegmentIndex::new();
        index.remove(k[0], 0, 1);
    }

    #[test]
    fn test_random_non_overlapping_queries_match_scan() {
        let mut rng = rand::thread_rng();
        let k = keys(200);
        let mut index = SegmentIndex::new();
        let mut ranges = Vec::new();

        let mut position = 0u64;
        for key in &k {
            position += rng.gen_range(0..20);
            let length = rng.gen_range(1..15);
            ranges.push((position, length));
            index.add(*key, position, length);
            position += length;
        }
        index.validate().unwrap();

        for _ in 0..2000 {
            let start = rng.gen_range(0..position + 10);
            let length = rng.gen_range(0..30);
            let expected = ranges
                .iter()
                .any(|&(s, l)| length > 0 && s < start + length && start < s + l);
            let found = index.find_first_overlap(start, length);
            assert_eq!(found.is_some(), expected, "query {start}+{length}");
            if let Some(idx) = found {
                assert!(index.record(idx).unwrap().overlaps(start, length));
            }
        }
    }

    #[test]
    fn test_random_churn_keeps_cache_valid() {
        let mut rng = rand::thread_rng();
        let k = keys(100);
        let mut index = SegmentIndex::new();
        let mut live: Vec<(SegmentKey, u64, u64)> = Vec::new();

        for key in &k {
            let entry = (*key, rng.gen_range(0..500), rng.gen_range(1..80));
            index.add(entry.0, entry.1, entry.2);
            live.push(entry);
        }

        for _ in 0..300 {
            let victim = rng.gen_range(0..live.len());
            let (key, start, length) = live[victim];
            let new_start = rng.gen_range(0..500);
            let new_length = rng.gen_range(1..80);
            index.update(key, (start, length), new_start, new_length);
            live[victim] = (key, new_start, new_length);
            index.validate().unwrap();

            let query_start = rng.gen_range(0..600);
            let query_length = rng.gen_range(1..40);
            let mut expected: Vec<SegmentKey> = live
                .iter()
                .filter(|&&(_, s, l)| s < query_start + query_length && query_start < s + l)
                .map(|&(key, _, _)| key)
                .collect();
            let mut actual: Vec<SegmentKey> = index
                .overlapping(query_start, query_length)
                .iter()
                .map(|r| r.segment)
                .collect();
            expected.sort();
            actual.sort();
            assert_eq!(actual, expected);
        }
    }
}
