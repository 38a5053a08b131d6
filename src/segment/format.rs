//! Bit-exact on-disk key-block format.
//!
//! A disk segment is a pair of files. The *data file* is a raw
//! concatenation of value bytes with no framing; offsets and lengths live
//! in the key file. The *key file* is a sequence of independently readable
//! 4096-byte blocks, each a dense run of entry records:
//!
//! ```text
//! entry := key_len     : u16 little-endian
//!          key_bytes   : key_len-dependent
//!          data_offset : i64 little-endian   // byte offset into the data file
//!          data_len    : u32 little-endian   // value length, or tombstone
//! ```
//!
//! `key_len` is overloaded. High bit clear: the raw key length
//! (1..=1024). High bit set: the key is prefix-compressed against the
//! previous entry in the block — the low 8 bits are the stored suffix
//! length, the next 7 bits the prefix length reused from the previous
//! key. The first entry of every block is always uncompressed.
//!
//! The raw `key_len` value [`END_OF_BLOCK`] (`0x8000` — high bit set,
//! both sub-lengths zero, otherwise meaningless) terminates a block; the
//! remainder is zero padding. `data_len == 0xFFFF_FFFF` marks a
//! tombstone: no bytes exist in the data file and `data_offset` must be
//! ignored (it is still written, for record uniformity).
//!
//! Everything here owns the format; the writer and the disk segment reader
//! only move bytes. The format never changes due to a dependency upgrade
//! because there is no dependency — all encoding is hand-written
//! little-endian.

use super::SegmentError;

// ------------------------------------------------------------------------------------------------
// Format constants
// ------------------------------------------------------------------------------------------------

/// Size of one key-file block. Format-defining: blocks are located by
/// `block * KEY_BLOCK_SIZE` arithmetic, so this must never change across
/// writes to the same database.
pub(crate) const KEY_BLOCK_SIZE: usize = 4096;

/// Hard upper bound on key length, enforced at write time.
pub(crate) const MAX_KEY_SIZE: usize = 1024;

/// Sparse index stride: the first key of every `KEY_INDEX_INTERVAL`-th
/// block is kept in memory.
pub(crate) const KEY_INDEX_INTERVAL: u64 = 2;

/// Raw `key_len` value terminating a block.
pub(crate) const END_OF_BLOCK: u16 = 0x8000;

/// High bit of `key_len`: the key is prefix-compressed.
pub(crate) const COMPRESSED_BIT: u16 = 0x8000;

/// `data_len` value marking a tombstone.
pub(crate) const TOMBSTONE_DATA_LEN: u32 = 0xFFFF_FFFF;

/// Fixed per-entry overhead: `key_len` + `data_offset` + `data_len`.
pub(crate) const ENTRY_OVERHEAD: usize = 2 + 8 + 4;

const MAX_PREFIX_LEN: u16 = 0x7F;
const MAX_SUFFIX_LEN: u16 = 0xFF;

// ------------------------------------------------------------------------------------------------
// Key compression
// ------------------------------------------------------------------------------------------------

/// An encoded `key_len` field plus the suffix bytes to store.
pub(crate) struct EncodedKey<'a> {
    pub key_len: u16,
    pub suffix: &'a [u8],
}

/// Prefix-compress `key` against the previous key written to the same
/// block. An empty `prev` (block start) always yields an uncompressed
/// encoding.
pub(crate) fn encode_key<'a>(key: &'a [u8], prev: &[u8]) -> EncodedKey<'a> {
    let prefix = shared_prefix(prev, key);
    if prefix > 0 {
        let suffix = &key[prefix..];
        EncodedKey {
            key_len: COMPRESSED_BIT | ((prefix as u16) << 8) | suffix.len() as u16,
            suffix,
        }
    } else {
        EncodedKey {
            key_len: key.len() as u16,
            suffix: key,
        }
    }
}

/// Longest usable shared prefix. Falls back to 0 (store uncompressed)
/// when either sub-length would overflow its bit field.
fn shared_prefix(prev: &[u8], key: &[u8]) -> usize {
    if prev.is_empty() {
        return 0;
    }
    let mut len = 0;
    while len < prev.len() && len < key.len() && prev[len] == key[len] {
        len += 1;
    }
    if len > MAX_PREFIX_LEN as usize || key.len() - len > MAX_SUFFIX_LEN as usize {
        return 0;
    }
    len
}

/// Split a `key_len` field into `(prefix_len, suffix_len)`.
///
/// Callers must check for [`END_OF_BLOCK`] first; it decodes here as an
/// invalid zero-suffix compressed key.
pub(crate) fn decode_key_len(key_len: u16) -> Result<(usize, usize), SegmentError> {
    if key_len & COMPRESSED_BIT != 0 {
        let prefix = ((key_len >> 8) & MAX_PREFIX_LEN) as usize;
        let suffix = (key_len & MAX_SUFFIX_LEN) as usize;
        if suffix == 0 {
            return Err(SegmentError::InvalidKeyLength(key_len));
        }
        Ok((prefix, suffix))
    } else {
        if key_len == 0 || key_len as usize > MAX_KEY_SIZE {
            return Err(SegmentError::InvalidKeyLength(key_len));
        }
        Ok((0, key_len as usize))
    }
}

// ------------------------------------------------------------------------------------------------
// Bounded little-endian block reads
// ------------------------------------------------------------------------------------------------

/// Verify `buf` holds `needed` bytes at `at`. A record running off the end
/// of its block is corruption, never a panic.
pub(crate) fn require(buf: &[u8], at: usize, needed: usize) -> Result<(), SegmentError> {
    if at + needed > buf.len() {
        return Err(SegmentError::Corrupt(format!(
            "truncated block record: need {} bytes at offset {}, block holds {}",
            needed,
            at,
            buf.len()
        )));
    }
    Ok(())
}

pub(crate) fn read_u16_at(buf: &[u8], at: usize) -> Result<u16, SegmentError> {
    require(buf, at, 2)?;
    Ok(u16::from_le_bytes([buf[at], buf[at + 1]]))
}

pub(crate) fn read_u32_at(buf: &[u8], at: usize) -> Result<u32, SegmentError> {
    require(buf, at, 4)?;
    Ok(u32::from_le_bytes([
        buf[at],
        buf[at + 1],
        buf[at + 2],
        buf[at + 3],
    ]))
}

pub(crate) fn read_i64_at(buf: &[u8], at: usize) -> Result<i64, SegmentError> {
    require(buf, at, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    Ok(i64::from_le_bytes(raw))
}
