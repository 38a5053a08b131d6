//! Segment file writer.
//!
//! Consumes an ordered entry iterator (a committed memory segment, or the
//! merge overlay during compaction) and produces a key + data file pair.
//! Both files are written under `.tmp` names and renamed into place, so a
//! reader can never observe a half-written segment; a crash leaves only
//! `.tmp` litter, which open() treats as fatal.
//!
//! The sparse key index is collected while writing so the fresh segment
//! can be loaded without re-reading its own blocks.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::disk::DiskSegment;
use super::format::{
    encode_key, END_OF_BLOCK, ENTRY_OVERHEAD, KEY_BLOCK_SIZE, KEY_INDEX_INTERVAL,
    TOMBSTONE_DATA_LEN,
};
use super::{SegmentError, SegmentIterator};

const ZEROS: [u8; KEY_BLOCK_SIZE] = [0; KEY_BLOCK_SIZE];

/// Write the iterator out as a segment pair and load the result.
///
/// Returns `Ok(None)` when the iterator was empty — no files are created
/// and no segment exists (a committed transaction with no writes).
pub(crate) fn write_and_load_segment(
    key_path: &Path,
    data_path: &Path,
    id: u64,
    iter: &mut impl SegmentIterator,
) -> Result<Option<DiskSegment>, SegmentError> {
    let key_tmp = tmp_name(key_path);
    let data_tmp = tmp_name(data_path);

    let key_index = match write_segment_files(&key_tmp, &data_tmp, iter) {
        Ok(Some(index)) => index,
        Ok(None) => {
            let _ = fs::remove_file(&key_tmp);
            let _ = fs::remove_file(&data_tmp);
            return Ok(None);
        }
        Err(err) => {
            let _ = fs::remove_file(&key_tmp);
            let _ = fs::remove_file(&data_tmp);
            return Err(err);
        }
    };

    fs::rename(&key_tmp, key_path)?;
    fs::rename(&data_tmp, data_path)?;

    debug!(id, key_file = %key_path.display(), "segment written");

    DiskSegment::open(key_path, data_path, id, Some(key_index)).map(Some)
}

/// `<name>.tmp` beside the final name. `Path::with_extension` would
/// replace the trailing segment id, so the suffix is appended raw.
fn tmp_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Stream entries into the two files. Returns the sparse key index, or
/// `None` when the iterator produced nothing.
fn write_segment_files(
    key_path: &Path,
    data_path: &Path,
    iter: &mut impl SegmentIterator,
) -> Result<Option<Vec<Vec<u8>>>, SegmentError> {
    let key_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(key_path)?;
    let data_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(data_path)?;
    let mut key_w = BufWriter::new(key_file);
    let mut data_w = BufWriter::new(data_file);

    let mut key_index: Vec<Vec<u8>> = Vec::new();
    let mut data_offset: i64 = 0;
    let mut block_len = 0usize;
    let mut block: u64 = 0;
    let mut key_count = 0usize;
    let mut prev_key: Vec<u8> = Vec::new();

    while let Some(entry) = iter.next_entry()? {
        key_count += 1;

        if let Some(value) = &entry.value {
            data_w.write_all(value)?;
        }

        // Fit check with the uncompressed key length (conservative), always
        // leaving room for the end-of-block marker.
        if block_len + ENTRY_OVERHEAD + entry.key.len() >= KEY_BLOCK_SIZE - 2 {
            finish_block(&mut key_w, &mut block_len)?;
            prev_key.clear();
        }

        if block_len == 0 {
            if block % KEY_INDEX_INTERVAL == 0 {
                key_index.push(entry.key.clone());
            }
            block += 1;
        }

        let data_len = match &entry.value {
            Some(value) => value.len() as u32,
            None => TOMBSTONE_DATA_LEN,
        };

        let encoded = encode_key(&entry.key, &prev_key);
        key_w.write_all(&encoded.key_len.to_le_bytes())?;
        key_w.write_all(encoded.suffix)?;
        key_w.write_all(&data_offset.to_le_bytes())?;
        key_w.write_all(&data_len.to_le_bytes())?;
        block_len += ENTRY_OVERHEAD + encoded.suffix.len();

        if let Some(value) = &entry.value {
            data_offset += value.len() as i64;
        }
        prev_key.clear();
        prev_key.extend_from_slice(&entry.key);
    }

    // Pad the trailing partial block out to the block size.
    if block_len > 0 && block_len < KEY_BLOCK_SIZE {
        finish_block(&mut key_w, &mut block_len)?;
    }

    key_w.flush()?;
    data_w.flush()?;

    if key_count == 0 {
        return Ok(None);
    }
    Ok(Some(key_index))
}

fn finish_block(w: &mut impl Write, block_len: &mut usize) -> Result<(), SegmentError> {
    w.write_all(&END_OF_BLOCK.to_le_bytes())?;
    *block_len += 2;
    w.write_all(&ZEROS[*block_len..])?;
    *block_len = 0;
    Ok(())
}
