#![forbid(unsafe_code)]

//! Minimal RLP encoder for legacy transactions.

pub fn encode_bytes(b: &[u8]) -> Vec<u8> {
    if b.len() == 1 && b[0] < 0x80 {
        return b.to_vec();
    }
    let mut out = length_prefix(0x80, 0xb7, b.len());
    out.extend_from_slice(b);
    out
}

/// Integers are encoded big-endian with leading zeros stripped; zero is the empty string.
pub fn encode_uint(x: u128) -> Vec<u8> {
    let be = x.to_be_bytes();
    let first = be.iter().position(|b| *b != 0).unwrap_or(be.len());
    encode_bytes(&be[first..])
}

pub fn encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(Vec::len).sum();
    let mut out = length_prefix(0xc0, 0xf7, payload_len);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

fn length_prefix(short_base: u8, long_base: u8, len: usize) -> Vec<u8> {
    if len <= 55 {
        return vec![short_base + len as u8];
    }
    let be = (len as u64).to_be_bytes();
    let first = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
    let len_bytes = &be[first..];
    let mut out = Vec::with_capacity(1 + len_bytes.len() + len);
    out.push(long_base + len_bytes.len() as u8);
    out.extend_from_slice(len_bytes);
    out
}
