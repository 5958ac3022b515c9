//! Low-level integer coding shared by the key and entry formats.

/// Max bytes a varint32 can occupy
pub const MAX_VARINT32_LEN: usize = 5;

/// Number of bytes `v` occupies when varint-encoded
pub fn varint_length(mut v: u64) -> usize {
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Append `v` as a varint32
pub fn put_varint32(dst: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; MAX_VARINT32_LEN];
    let n = encode_varint32(&mut buf, v);
    dst.extend_from_slice(&buf[..n]);
}

/// Write `v` as a varint32 at the front of `dst`, returning the bytes written.
///
/// Panics if `dst` is shorter than `varint_length(v)`.
pub fn encode_varint32(dst: &mut [u8], mut v: u32) -> usize {
    let mut i = 0;
    while v >= 0x80 {
        dst[i] = (v as u8) | 0x80;
        v >>= 7;
        i += 1;
    }
    dst[i] = v as u8;
    i + 1
}

/// Decode a varint32 from the front of `src`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// input is truncated or the encoding overflows 32 bits.
pub fn decode_varint32(src: &[u8]) -> Option<(u32, usize)> {
    let mut result: u32 = 0;
    for (i, &byte) in src.iter().take(MAX_VARINT32_LEN).enumerate() {
        let shift = 7 * i as u32;
        if i == MAX_VARINT32_LEN - 1 && byte > 0x0f {
            return None;
        }
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
    }
    None
}

pub fn encode_fixed64(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

/// Decode a little-endian u64 from the first 8 bytes of `src`
pub fn decode_fixed64(src: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = src.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}
