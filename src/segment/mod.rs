//! # Segment Module
//!
//! A table is an ordered list of *segments*, oldest first. Every segment
//! is an independent sorted run of `(key, value)` entries; a `None` value
//! is a tombstone recording "this key was removed at this segment's
//! logical time". Later segments shadow earlier ones on point lookup.
//!
//! ## Variants
//!
//! | Variant | Mutability | Backing |
//! |---------|------------|---------|
//! | `MemorySegment` | mutable, owned by one transaction until commit | balanced tree |
//! | `DiskSegment` | immutable, shared | key + data file pair |
//! | `MultiSegment` | read-only composite | other segments |
//!
//! Mutating operations exist only on the memory segment; the disk segment
//! simply has no `put`/`remove`, so misuse is rejected at compile time.
//! The overlay delegates writes to its writable leg and treats a write
//! without one as a fatal programming error.
//!
//! ## Iteration contract
//!
//! Segment iterators yield entries in key order *including tombstones* —
//! shadowing and filtering are decided by the layers above (the overlay's
//! k-way merge and the transaction's live-entry filter). `peek_key` exists
//! solely so the k-way merge can compare head keys without consuming them.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

pub(crate) mod disk;
pub(crate) mod format;
pub(crate) mod memory;
pub(crate) mod multi;
pub(crate) mod writer;

use std::io;
use std::sync::Arc;

use thiserror::Error;

use disk::{DiskSegment, DiskSegmentIterator};
use memory::{MemorySegment, MemorySegmentIterator};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors from segment I/O and block decoding.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying filesystem failure (short block reads included).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A `key_len` field that decodes to nothing representable.
    #[error("invalid key length field 0x{0:04x}")]
    InvalidKeyLength(u16),

    /// Structurally broken block or file.
    #[error("corrupt segment: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Shared types
// ------------------------------------------------------------------------------------------------

/// One key with its optional value. `None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Outcome of a point lookup against one segment (or an overlay).
///
/// `Tombstone` and `NotFound` must stay distinguishable: a tombstone stops
/// the overlay's newest-to-oldest probe, plain absence does not.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SegmentGetResult {
    /// Live value for the key.
    Value(Vec<u8>),
    /// The key was removed at this segment's logical time.
    Tombstone,
    /// This segment holds no entry for the key.
    NotFound,
}

/// Ordered iteration over one segment's entries, tombstones included.
pub(crate) trait SegmentIterator {
    /// Key of the entry the next [`next_entry`](Self::next_entry) call
    /// yields, without consuming it. `None` once exhausted.
    fn peek_key(&mut self) -> Result<Option<&[u8]>, SegmentError>;

    /// Next entry in key order, or `None` once exhausted.
    fn next_entry(&mut self) -> Result<Option<Entry>, SegmentError>;
}

// ------------------------------------------------------------------------------------------------
// SegmentHandle — cloneable reference into a table's segment list
// ------------------------------------------------------------------------------------------------

/// Cheap, cloneable handle to one segment in a table's list.
///
/// Disk segments are shared read-only across every transaction overlay and
/// the merge worker; the `Arc` keeps the file handles alive until the last
/// reader drops. The commit writer and the merge worker splice lists by
/// *identity* ([`SegmentHandle::same`]), never by content.
#[derive(Clone)]
pub(crate) enum SegmentHandle {
    Memory(Arc<MemorySegment>),
    Disk(Arc<DiskSegment>),
}

impl SegmentHandle {
    pub fn get(&self, key: &[u8]) -> Result<SegmentGetResult, SegmentError> {
        match self {
            SegmentHandle::Memory(segment) => Ok(segment.get(key)),
            SegmentHandle::Disk(segment) => segment.get(key),
        }
    }

    pub fn lookup(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<SegmentIter, SegmentError> {
        match self {
            SegmentHandle::Memory(segment) => {
                Ok(SegmentIter::Memory(segment.lookup(lower, upper)))
            }
            SegmentHandle::Disk(segment) => {
                Ok(SegmentIter::Disk(DiskSegment::lookup(segment, lower, upper)?))
            }
        }
    }

    /// Pointer identity, not content equality.
    pub fn same(&self, other: &SegmentHandle) -> bool {
        match (self, other) {
            (SegmentHandle::Memory(a), SegmentHandle::Memory(b)) => Arc::ptr_eq(a, b),
            (SegmentHandle::Disk(a), SegmentHandle::Disk(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_disk(&self) -> Option<&Arc<DiskSegment>> {
        match self {
            SegmentHandle::Disk(segment) => Some(segment),
            SegmentHandle::Memory(_) => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentIter — per-segment iterator, statically dispatched
// ------------------------------------------------------------------------------------------------

/// Concrete per-segment iterator. Static dispatch keeps the k-way merge
/// and the segment writer monomorphic.
pub(crate) enum SegmentIter {
    Memory(MemorySegmentIterator),
    Disk(DiskSegmentIterator),
}

impl SegmentIterator for SegmentIter {
    fn peek_key(&mut self) -> Result<Option<&[u8]>, SegmentError> {
        match self {
            SegmentIter::Memory(iter) => iter.peek_key(),
            SegmentIter::Disk(iter) => iter.peek_key(),
        }
    }

    fn next_entry(&mut self) -> Result<Option<Entry>, SegmentError> {
        match self {
            SegmentIter::Memory(iter) => iter.next_entry(),
            SegmentIter::Disk(iter) => iter.next_entry(),
        }
    }
}
