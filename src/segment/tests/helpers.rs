use std::path::Path;
use std::sync::Arc;

use crate::segment::disk::DiskSegment;
use crate::segment::memory::MemorySegment;
use crate::segment::writer::write_and_load_segment;
use crate::segment::{Entry, SegmentIterator};

/// Build a memory segment from `(key, value)` pairs; a `None` value
/// records a tombstone.
pub fn memory_segment(entries: &[(&[u8], Option<&[u8]>)]) -> MemorySegment {
    let segment = MemorySegment::new();
    for (key, value) in entries {
        match value {
            Some(value) => segment.put(key, value),
            None => {
                segment.remove(key);
            }
        }
    }
    segment
}

/// Write the entries through the segment codec and load the result.
pub fn disk_segment(dir: &Path, id: u64, entries: &[(&[u8], Option<&[u8]>)]) -> Arc<DiskSegment> {
    let memory = memory_segment(entries);
    let mut iter = memory.lookup(None, None);
    let key_path = dir.join(format!("main.keys.{id}"));
    let data_path = dir.join(format!("main.data.{id}"));
    let segment = write_and_load_segment(&key_path, &data_path, id, &mut iter)
        .expect("write segment")
        .expect("segment not empty");
    Arc::new(segment)
}

/// Drain an iterator into a vector of entries.
pub fn collect(iter: &mut impl SegmentIterator) -> Vec<Entry> {
    let mut out = Vec::new();
    while let Some(entry) = iter.next_entry().expect("iterate") {
        out.push(entry);
    }
    out
}

/// Keys whose shared prefixes exercise the compression path, long enough
/// values to spread a segment across several 4096-byte key blocks.
pub fn bulk_entries(count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..count)
        .map(|i| {
            (
                format!("bulk-key-{i:07}").into_bytes(),
                format!("value-for-entry-{i:07}").into_bytes(),
            )
        })
        .collect()
}
