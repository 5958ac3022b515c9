//! Internal key format
//!
//! Every stored version is addressed by an *internal key*:
//!
//! ```text
//! ┌──────────────────────┬───────────────────────────────────┐
//! │ user_key (variable)  │ trailer: (seq << 8) | type  (8 LE) │
//! └──────────────────────┴───────────────────────────────────┘
//! ```
//!
//! Internal keys sort by user key ascending, then trailer descending, so the
//! newest version of a key is met first during a forward scan.
//!
//! A memtable *entry* wraps the internal key together with its value:
//!
//! ```text
//! varint32(ikey_len) | ikey | varint32(value_len) | value
//! ```

use serde::{Deserialize, Serialize};

use crate::coding::{decode_fixed64, decode_varint32, encode_varint32, varint_length};
use crate::error::{KestrelError, Result};

/// Monotonically increasing write counter
pub type SequenceNumber = u64;

/// Largest sequence number that fits in the 56-bit trailer field
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1u64 << 56) - 1;

/// Size of the packed `(seq, type)` trailer
pub const TRAILER_SIZE: usize = 8;

/// Kind of record stored under an internal key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    Deletion = 0x0,
    Value = 0x1,
    Merge = 0x2,
    SingleDeletion = 0x7,
    RangeDeletion = 0xF,
    BlobIndex = 0x11,
}

/// Type byte used when building seek targets. It is the largest tag, so a
/// target built at sequence `s` sorts before every real entry at `s`.
pub const VALUE_TYPE_FOR_SEEK: u8 = ValueType::BlobIndex as u8;

impl ValueType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x0 => Some(ValueType::Deletion),
            0x1 => Some(ValueType::Value),
            0x2 => Some(ValueType::Merge),
            0x7 => Some(ValueType::SingleDeletion),
            0xF => Some(ValueType::RangeDeletion),
            0x11 => Some(ValueType::BlobIndex),
            _ => None,
        }
    }

    /// Point tombstones (range deletions live in their own container)
    pub fn is_point_deletion(self) -> bool {
        matches!(self, ValueType::Deletion | ValueType::SingleDeletion)
    }
}

pub fn pack_trailer(seq: SequenceNumber, tag: u8) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | tag as u64
}

pub fn unpack_trailer(trailer: u64) -> (SequenceNumber, u8) {
    (trailer >> 8, (trailer & 0xff) as u8)
}

/// Append `user_key ++ trailer` to `dst`
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, tag: u8) {
    dst.extend_from_slice(user_key);
    dst.extend_from_slice(&pack_trailer(seq, tag).to_le_bytes());
}

pub fn internal_key(user_key: &[u8], seq: SequenceNumber, value_type: ValueType) -> Vec<u8> {
    let mut out = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
    append_internal_key(&mut out, user_key, seq, value_type as u8);
    out
}

/// User-key portion of an internal key. Keys shorter than a trailer yield
/// an empty slice; callers that need validation use [`ParsedInternalKey::parse`].
pub fn extract_user_key(ikey: &[u8]) -> &[u8] {
    &ikey[..ikey.len().saturating_sub(TRAILER_SIZE)]
}

pub fn extract_trailer(ikey: &[u8]) -> u64 {
    if ikey.len() < TRAILER_SIZE {
        return 0;
    }
    decode_fixed64(&ikey[ikey.len() - TRAILER_SIZE..]).unwrap_or(0)
}

/// Borrowed, decoded view of an internal key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn parse(ikey: &'a [u8]) -> Result<Self> {
        if ikey.len() < TRAILER_SIZE {
            return Err(KestrelError::corruption(format!(
                "internal key too short: {} bytes",
                ikey.len()
            )));
        }
        let (sequence, tag) = unpack_trailer(extract_trailer(ikey));
        let value_type = ValueType::from_u8(tag)
            .ok_or_else(|| KestrelError::corruption(format!("unknown value type {:#x}", tag)))?;
        Ok(Self {
            user_key: extract_user_key(ikey),
            sequence,
            value_type,
        })
    }
}

/// Seek target for a point read at a snapshot
#[derive(Debug, Clone)]
pub struct LookupKey {
    ikey: Vec<u8>,
}

impl LookupKey {
    pub fn new(user_key: &[u8], snapshot: SequenceNumber) -> Self {
        let mut ikey = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        append_internal_key(&mut ikey, user_key, snapshot.min(MAX_SEQUENCE_NUMBER), VALUE_TYPE_FOR_SEEK);
        Self { ikey }
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.ikey
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.ikey)
    }

    pub fn sequence(&self) -> SequenceNumber {
        unpack_trailer(extract_trailer(&self.ikey)).0
    }
}

// =============================================================================
// Memtable Entry Encoding
// =============================================================================

/// Encoded size of a memtable entry
pub fn encoded_entry_len(user_key: &[u8], value: &[u8]) -> usize {
    let ikey_len = user_key.len() + TRAILER_SIZE;
    varint_length(ikey_len as u64) + ikey_len + varint_length(value.len() as u64) + value.len()
}

/// Encode an entry into `dst`, which must be exactly
/// [`encoded_entry_len`] bytes long.
///
/// Returns the offset where the value section (`varint32(len) | value`)
/// begins.
pub fn encode_entry(
    dst: &mut [u8],
    user_key: &[u8],
    seq: SequenceNumber,
    value_type: ValueType,
    value: &[u8],
) -> Result<usize> {
    if dst.len() != encoded_entry_len(user_key, value) {
        return Err(KestrelError::invalid("entry buffer has the wrong length"));
    }
    if seq > MAX_SEQUENCE_NUMBER {
        return Err(KestrelError::invalid(format!("sequence {} out of range", seq)));
    }
    let ikey_len = user_key.len() + TRAILER_SIZE;
    let ikey_len32 = u32::try_from(ikey_len).map_err(|_| KestrelError::invalid("key too large"))?;
    let value_len32 =
        u32::try_from(value.len()).map_err(|_| KestrelError::invalid("value too large"))?;

    let mut pos = encode_varint32(dst, ikey_len32);
    dst[pos..pos + user_key.len()].copy_from_slice(user_key);
    pos += user_key.len();
    dst[pos..pos + TRAILER_SIZE].copy_from_slice(&pack_trailer(seq, value_type as u8).to_le_bytes());
    pos += TRAILER_SIZE;

    let value_offset = pos;
    pos += encode_varint32(&mut dst[pos..], value_len32);
    dst[pos..pos + value.len()].copy_from_slice(value);
    Ok(value_offset)
}

/// Decode an entry produced by [`encode_entry`]
pub fn decode_entry(src: &[u8]) -> Result<(ParsedInternalKey<'_>, &[u8])> {
    let (ikey_len, n) =
        decode_varint32(src).ok_or_else(|| KestrelError::corruption("bad entry key length"))?;
    let ikey_end = n + ikey_len as usize;
    let ikey = src
        .get(n..ikey_end)
        .ok_or_else(|| KestrelError::corruption("entry key truncated"))?;
    let parsed = ParsedInternalKey::parse(ikey)?;
    let value = decode_length_prefixed(&src[ikey_end..])?;
    Ok((parsed, value))
}

/// Decode a `varint32(len) | bytes` section
pub fn decode_length_prefixed(src: &[u8]) -> Result<&[u8]> {
    let (len, n) =
        decode_varint32(src).ok_or_else(|| KestrelError::corruption("bad value length"))?;
    src.get(n..n + len as usize)
        .ok_or_else(|| KestrelError::corruption("value truncated"))
}
