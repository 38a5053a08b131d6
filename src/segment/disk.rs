//! Immutable on-disk segment.
//!
//! Opens the key + data file pair read-only and serves point lookups and
//! range scans against the block format in [`format`](super::format).
//!
//! Point lookup narrows the candidate block range with the sparse key
//! index (every 2nd block's first key), binary-searches block first keys
//! — always stored uncompressed, so a single 4096-byte read per probe —
//! and finally scans one block, reconstructing prefix-compressed keys
//! with the running previous key.
//!
//! All reads go through positional I/O (`read_exact_at`), so a single
//! segment serves any number of concurrent readers without seeking state.

use std::fs;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::format::{
    self, COMPRESSED_BIT, END_OF_BLOCK, KEY_BLOCK_SIZE, KEY_INDEX_INTERVAL, MAX_KEY_SIZE,
    TOMBSTONE_DATA_LEN,
};
use super::{Entry, SegmentError, SegmentGetResult, SegmentIterator};

pub(crate) struct DiskSegment {
    key_file: File,
    data_file: File,
    key_path: PathBuf,
    data_path: PathBuf,
    key_blocks: u64,
    id: u64,
    /// First key of every `KEY_INDEX_INTERVAL`-th block.
    key_index: Vec<Vec<u8>>,
}

impl DiskSegment {
    /// Open both files read-only. `key_index` comes from the writer for a
    /// freshly written segment; pre-existing segments pass `None` and the
    /// index is rebuilt by reading the first entry of each indexed block.
    pub fn open(
        key_path: &Path,
        data_path: &Path,
        id: u64,
        key_index: Option<Vec<Vec<u8>>>,
    ) -> Result<Self, SegmentError> {
        let key_file = File::open(key_path)?;
        let data_file = File::open(data_path)?;

        let size = key_file.metadata()?.len();
        if size == 0 {
            return Err(SegmentError::Corrupt(format!(
                "empty key file {}",
                key_path.display()
            )));
        }
        let key_blocks = size.div_ceil(KEY_BLOCK_SIZE as u64);

        let key_index = match key_index {
            Some(index) => index,
            None => load_key_index(&key_file, key_blocks)?,
        };

        Ok(DiskSegment {
            key_file,
            data_file,
            key_path: key_path.to_path_buf(),
            data_path: data_path.to_path_buf(),
            key_blocks,
            id,
            key_index,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unlink both backing files. Only the merge worker calls this, after
    /// the table's in-flight count reached zero and the segment left the
    /// list — no overlay can still be scanning it.
    pub fn delete_files(&self) -> Result<(), SegmentError> {
        fs::remove_file(&self.key_path)?;
        fs::remove_file(&self.data_path)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<SegmentGetResult, SegmentError> {
        let mut buf = vec![0u8; KEY_BLOCK_SIZE];

        // Sparse index: position of the first indexed key strictly greater
        // than the probe. Zero means the probe sorts below the segment's
        // smallest key.
        let at = self.key_index.partition_point(|k| k.as_slice() <= key);
        if at == 0 {
            return Ok(SegmentGetResult::NotFound);
        }
        let low = (at as u64 - 1) * KEY_INDEX_INTERVAL;
        let high = (low + KEY_INDEX_INTERVAL).min(self.key_blocks - 1);

        let block = self.search_blocks(low, high, key, &mut buf)?;
        self.scan_block(block, key, &mut buf)
    }

    /// Binary search over block first keys. Returns the block that may
    /// hold `key` — or the one before it, since blocks record no last
    /// key; the caller's scan settles it.
    fn search_blocks(
        &self,
        mut low: u64,
        mut high: u64,
        key: &[u8],
        buf: &mut [u8],
    ) -> Result<u64, SegmentError> {
        while high - low > 1 {
            let mid = (high - low) / 2 + low;
            if key < self.first_key(mid, buf)? {
                high = mid;
            } else {
                low = mid;
            }
        }
        if high > low && key < self.first_key(high, buf)? {
            Ok(low)
        } else {
            Ok(high)
        }
    }

    fn first_key<'b>(&self, block: u64, buf: &'b mut [u8]) -> Result<&'b [u8], SegmentError> {
        self.read_block(block, buf)?;
        block_first_key(buf)?.ok_or_else(|| {
            SegmentError::Corrupt(format!("block {block} starts with the end-of-block marker"))
        })
    }

    /// Walk one block, reconstructing prefix-compressed keys, until the
    /// probe key is met or passed.
    fn scan_block(
        &self,
        block: u64,
        key: &[u8],
        buf: &mut [u8],
    ) -> Result<SegmentGetResult, SegmentError> {
        self.read_block(block, buf)?;

        let mut at = 0usize;
        let mut prev_key: Vec<u8> = Vec::new();
        loop {
            let key_len = format::read_u16_at(buf, at)?;
            if key_len == END_OF_BLOCK {
                return Ok(SegmentGetResult::NotFound);
            }
            let (prefix_len, suffix_len) = format::decode_key_len(key_len)?;
            at += 2;
            format::require(buf, at, suffix_len + 12)?;
            if prefix_len > prev_key.len() {
                return Err(SegmentError::Corrupt(format!(
                    "prefix length {} exceeds previous key length {}",
                    prefix_len,
                    prev_key.len()
                )));
            }

            let mut entry_key = Vec::with_capacity(prefix_len + suffix_len);
            entry_key.extend_from_slice(&prev_key[..prefix_len]);
            entry_key.extend_from_slice(&buf[at..at + suffix_len]);
            at += suffix_len;

            let data_offset = format::read_i64_at(buf, at)?;
            at += 8;
            let data_len = format::read_u32_at(buf, at)?;
            at += 4;

            match entry_key.as_slice().cmp(key) {
                std::cmp::Ordering::Equal => {
                    if data_len == TOMBSTONE_DATA_LEN {
                        return Ok(SegmentGetResult::Tombstone);
                    }
                    let mut value = vec![0u8; data_len as usize];
                    self.data_file.read_exact_at(&mut value, data_offset as u64)?;
                    return Ok(SegmentGetResult::Value(value));
                }
                std::cmp::Ordering::Greater => return Ok(SegmentGetResult::NotFound),
                std::cmp::Ordering::Less => prev_key = entry_key,
            }
        }
    }

    /// Range scan, `lower` unbounded starting at block zero. Bounds are
    /// inclusive on both ends.
    pub fn lookup(
        this: &Arc<Self>,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<DiskSegmentIterator, SegmentError> {
        let mut buf = vec![0u8; KEY_BLOCK_SIZE];
        let mut block = 0;
        if let Some(lower) = lower {
            block = this.search_blocks(0, this.key_blocks - 1, lower, &mut buf)?;
        }
        this.read_block(block, &mut buf)?;

        Ok(DiskSegmentIterator {
            segment: Arc::clone(this),
            lower: lower.map(<[u8]>::to_vec),
            upper: upper.map(<[u8]>::to_vec),
            buf,
            block,
            at: 0,
            prev_key: Vec::new(),
            pending: None,
            finished: false,
        })
    }

    /// Exactly one block; a short read is an error, never a partial block.
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<(), SegmentError> {
        self.key_file
            .read_exact_at(buf, block * KEY_BLOCK_SIZE as u64)?;
        Ok(())
    }
}

/// First key of a block, `None` when the block starts with the
/// end-of-block marker. Block first keys are never compressed.
fn block_first_key(buf: &[u8]) -> Result<Option<&[u8]>, SegmentError> {
    let key_len = format::read_u16_at(buf, 0)?;
    if key_len == END_OF_BLOCK {
        return Ok(None);
    }
    if key_len & COMPRESSED_BIT != 0 || key_len == 0 || key_len as usize > MAX_KEY_SIZE {
        return Err(SegmentError::InvalidKeyLength(key_len));
    }
    format::require(buf, 2, key_len as usize)?;
    Ok(Some(&buf[2..2 + key_len as usize]))
}

/// Rebuild the sparse index of a pre-existing segment by reading block
/// zero of every indexed block.
fn load_key_index(key_file: &File, key_blocks: u64) -> Result<Vec<Vec<u8>>, SegmentError> {
    let mut buf = vec![0u8; KEY_BLOCK_SIZE];
    let mut index = Vec::new();

    let mut block = 0;
    while block < key_blocks {
        key_file.read_exact_at(&mut buf, block * KEY_BLOCK_SIZE as u64)?;
        match block_first_key(&buf)? {
            Some(key) => index.push(key.to_vec()),
            None => break,
        }
        block += KEY_INDEX_INTERVAL;
    }
    Ok(index)
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

pub(crate) struct DiskSegmentIterator {
    segment: Arc<DiskSegment>,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    buf: Vec<u8>,
    block: u64,
    at: usize,
    /// Prefix-reconstruction state; reset at every block boundary.
    prev_key: Vec<u8>,
    pending: Option<Entry>,
    finished: bool,
}

impl DiskSegmentIterator {
    fn fill(&mut self) -> Result<(), SegmentError> {
        if self.pending.is_some() || self.finished {
            return Ok(());
        }
        loop {
            let key_len = format::read_u16_at(&self.buf, self.at)?;
            if key_len == END_OF_BLOCK {
                self.block += 1;
                if self.block == self.segment.key_blocks {
                    self.finished = true;
                    return Ok(());
                }
                self.segment.read_block(self.block, &mut self.buf)?;
                self.at = 0;
                self.prev_key.clear();
                continue;
            }

            let (prefix_len, suffix_len) = format::decode_key_len(key_len)?;
            self.at += 2;
            format::require(&self.buf, self.at, suffix_len + 12)?;
            if prefix_len > self.prev_key.len() {
                return Err(SegmentError::Corrupt(format!(
                    "prefix length {} exceeds previous key length {}",
                    prefix_len,
                    self.prev_key.len()
                )));
            }

            let mut key = Vec::with_capacity(prefix_len + suffix_len);
            key.extend_from_slice(&self.prev_key[..prefix_len]);
            key.extend_from_slice(&self.buf[self.at..self.at + suffix_len]);
            self.at += suffix_len;

            let data_offset = format::read_i64_at(&self.buf, self.at)?;
            self.at += 8;
            let data_len = format::read_u32_at(&self.buf, self.at)?;
            self.at += 4;

            self.prev_key.clear();
            self.prev_key.extend_from_slice(&key);

            // The start block was found by first-key binary search, so a
            // run of keys below `lower` may lead it; filter rather than
            // seek — the block is only 4 KiB.
            if let Some(lower) = &self.lower {
                if key.as_slice() < lower.as_slice() {
                    continue;
                }
            }
            if let Some(upper) = &self.upper {
                if key.as_slice() > upper.as_slice() {
                    self.finished = true;
                    return Ok(());
                }
            }

            let value = if data_len == TOMBSTONE_DATA_LEN {
                None
            } else {
                let mut value = vec![0u8; data_len as usize];
                self.segment
                    .data_file
                    .read_exact_at(&mut value, data_offset as u64)?;
                Some(value)
            };
            self.pending = Some(Entry { key, value });
            return Ok(());
        }
    }
}

impl SegmentIterator for DiskSegmentIterator {
    fn peek_key(&mut self) -> Result<Option<&[u8]>, SegmentError> {
        self.fill()?;
        Ok(self.pending.as_ref().map(|entry| entry.key.as_slice()))
    }

    fn next_entry(&mut self) -> Result<Option<Entry>, SegmentError> {
        self.fill()?;
        Ok(self.pending.take())
    }
}
