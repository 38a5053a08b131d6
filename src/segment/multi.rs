//! Multi-segment overlay.
//!
//! Presents an ordered sequence of segments (oldest first, plus at most
//! one writable memory segment positioned last) as a single logical
//! segment. Point lookups probe newest-to-oldest and the first segment
//! that knows the key — value or tombstone — wins. Range scans k-way
//! merge the per-segment iterators; on equal head keys the newest
//! iterator's entry is yielded and every other iterator discards that
//! key, so the merged stream is strictly ordered and duplicate-free.
//!
//! The overlay iterator is lazy, finite and non-restartable; it is a
//! per-transaction object and is never shared across threads.

use std::sync::Arc;

use super::memory::MemorySegment;
use super::{Entry, SegmentError, SegmentGetResult, SegmentHandle, SegmentIter, SegmentIterator};

pub(crate) struct MultiSegment {
    segments: Vec<SegmentHandle>,
    writable: Option<Arc<MemorySegment>>,
}

impl MultiSegment {
    /// Read-only overlay (compaction's view over a run of disk segments).
    pub fn read_only(segments: Vec<SegmentHandle>) -> Self {
        MultiSegment {
            segments,
            writable: None,
        }
    }

    /// Transaction view: `segments` already ends with `writable`.
    pub fn writable(segments: Vec<SegmentHandle>, writable: Arc<MemorySegment>) -> Self {
        MultiSegment {
            segments,
            writable: Some(writable),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<SegmentGetResult, SegmentError> {
        // Chronological list: probe in reverse so newer segments shadow.
        for segment in self.segments.iter().rev() {
            match segment.get(key)? {
                SegmentGetResult::NotFound => continue,
                hit => return Ok(hit),
            }
        }
        Ok(SegmentGetResult::NotFound)
    }

    /// Writing through an overlay without a writable leg is a programming
    /// error, not a runtime condition — hence the panic.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        match &self.writable {
            Some(segment) => segment.put(key, value),
            None => panic!("put on a read-only segment overlay"),
        }
    }

    /// See [`MemorySegment::remove`]; same read-only panic as `put`.
    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        match &self.writable {
            Some(segment) => segment.remove(key),
            None => panic!("remove on a read-only segment overlay"),
        }
    }

    pub fn lookup(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<MultiSegmentIterator, SegmentError> {
        let mut iters = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            iters.push(segment.lookup(lower, upper)?);
        }
        Ok(MultiSegmentIterator { iters })
    }
}

// ------------------------------------------------------------------------------------------------
// K-way merging iterator
// ------------------------------------------------------------------------------------------------

/// Merges per-segment iterators, newest-wins on equal keys. Tombstones
/// pass through; the transaction-facing wrapper filters them.
pub(crate) struct MultiSegmentIterator {
    /// Same order as the overlay's segment list: higher index = newer.
    iters: Vec<SegmentIter>,
}

impl MultiSegmentIterator {
    /// Index of the iterator whose head key is smallest. Scanning from the
    /// newest down and replacing only on strictly smaller keys makes the
    /// newest iterator win ties.
    fn lowest_index(&mut self) -> Result<Option<usize>, SegmentError> {
        let mut lowest: Option<Vec<u8>> = None;
        let mut lowest_at = None;

        for i in (0..self.iters.len()).rev() {
            let Some(key) = self.iters[i].peek_key()? else {
                continue;
            };
            let is_lower = match &lowest {
                None => true,
                Some(low) => key < low.as_slice(),
            };
            if is_lower {
                lowest = Some(key.to_vec());
                lowest_at = Some(i);
            }
        }
        Ok(lowest_at)
    }
}

impl SegmentIterator for MultiSegmentIterator {
    fn peek_key(&mut self) -> Result<Option<&[u8]>, SegmentError> {
        match self.lowest_index()? {
            None => Ok(None),
            Some(at) => self.iters[at].peek_key(),
        }
    }

    fn next_entry(&mut self) -> Result<Option<Entry>, SegmentError> {
        let Some(at) = self.lowest_index()? else {
            return Ok(None);
        };
        let Some(entry) = self.iters[at].next_entry()? else {
            return Ok(None);
        };

        // Every older iterator drops its (shadowed) copy of this key.
        for i in 0..self.iters.len() {
            if i == at {
                continue;
            }
            loop {
                let shadowed = match self.iters[i].peek_key()? {
                    Some(key) => key == entry.key.as_slice(),
                    None => false,
                };
                if !shadowed {
                    break;
                }
                self.iters[i].next_entry()?;
            }
        }

        Ok(Some(entry))
    }
}
