//! Mutable in-memory segment.
//!
//! A thin adapter from the balanced tree to the segment surface. Each
//! transaction owns exactly one memory segment; after commit the same
//! segment sits read-only in the table list until the background writer
//! swaps in its on-disk form. The `RwLock` covers that hand-off window,
//! where new transactions read the segment while the writer iterates it.

use std::sync::{PoisonError, RwLock};

use crate::tree::Tree;

use super::{Entry, SegmentError, SegmentGetResult, SegmentIterator};

pub(crate) struct MemorySegment {
    tree: RwLock<Tree>,
}

impl MemorySegment {
    pub fn new() -> Self {
        MemorySegment {
            tree: RwLock::new(Tree::new()),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.tree
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Some(value.to_vec()));
    }

    /// Record a tombstone for `key`, returning the value this segment
    /// previously held for it. The key may well live only in older
    /// segments, in which case the tombstone is still recorded.
    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.tree
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn get(&self, key: &[u8]) -> SegmentGetResult {
        match self
            .tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find(key)
        {
            None => SegmentGetResult::NotFound,
            Some(None) => SegmentGetResult::Tombstone,
            Some(Some(value)) => SegmentGetResult::Value(value.clone()),
        }
    }

    /// Snapshot the entries in range, tombstones included.
    pub fn lookup(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> MemorySegmentIterator {
        let entries = self
            .tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range(lower, upper);
        MemorySegmentIterator {
            entries: entries
                .into_iter()
                .map(|(key, value)| Entry { key, value })
                .collect::<Vec<_>>()
                .into_iter(),
            pending: None,
        }
    }
}

pub(crate) struct MemorySegmentIterator {
    entries: std::vec::IntoIter<Entry>,
    pending: Option<Entry>,
}

impl MemorySegmentIterator {
    fn fill(&mut self) {
        if self.pending.is_none() {
            self.pending = self.entries.next();
        }
    }
}

impl SegmentIterator for MemorySegmentIterator {
    fn peek_key(&mut self) -> Result<Option<&[u8]>, SegmentError> {
        self.fill();
        Ok(self.pending.as_ref().map(|entry| entry.key.as_slice()))
    }

    fn next_entry(&mut self) -> Result<Option<Entry>, SegmentError> {
        self.fill();
        Ok(self.pending.take())
    }
}
