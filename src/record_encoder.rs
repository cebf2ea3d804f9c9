//! Canonical binary encoding of signature records.
//!
//! These bytes are what gets signed, what the sweep re-verifies, and what
//! clients receive in `data.bin`. Layout, all integers little-endian:
//!
//! ```text
//! name_len:u32 | name:[u8] | prefix:u64 | sig_len:u32 | sig:[u8] |
//! offset_begin:i64 | offset_end:i64 | object_type:u8
//! ```
//!
//! The encoding depends only on field values. No timestamps, ids or
//! status flags go in.

use crate::model::SignatureRecord;

/// Fixed-width part of an encoded record (everything except name and body).
pub const FIXED_LEN: usize = 4 + 8 + 4 + 8 + 8 + 1;

/// Encode one record into its canonical bytes.
pub fn encode_record(record: &SignatureRecord) -> Vec<u8> {
    let name = ascii_bytes(&record.name);
    let prefix = parse_prefix(record.signature_prefix.as_deref());
    let body = parse_hex_bytes(record.signature_body.as_deref());
    let declared_len = record.signature_length.unwrap_or(body.len() as u32);
    let object_type = record.object_type.map(|t| t.code()).unwrap_or(0);

    let mut out = Vec::with_capacity(FIXED_LEN + name.len() + body.len());
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(&name);
    out.extend_from_slice(&prefix.to_le_bytes());
    out.extend_from_slice(&declared_len.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&record.offset_begin.unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&record.offset_end.unwrap_or(0).to_le_bytes());
    out.push(object_type);
    out
}

/// Concatenated canonical bytes of `records`, in order.
pub fn encode_all(records: &[SignatureRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&encode_record(record));
    }
    out
}

/// Expected encoded size for a name of `name_len` bytes and a body of `body_len` bytes.
pub fn encoded_len(name_len: usize, body_len: usize) -> usize {
    FIXED_LEN + name_len + body_len
}

/// Non-ASCII characters become `?`.
fn ascii_bytes(name: &str) -> Vec<u8> {
    name.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

/// Parse the prefix text into a 64-bit value.
///
/// Non-hex characters are dropped, only the first 16 hex digits count, and
/// the digits are read as one big-endian number. Absent or empty text gives 0.
pub fn parse_prefix(hex_text: Option<&str>) -> u64 {
    let Some(text) = hex_text else {
        return 0;
    };
    text.chars()
        .filter_map(|c| c.to_digit(16))
        .take(16)
        .fold(0u64, |acc, d| (acc << 4) | u64::from(d))
}

/// Decode hex text two digits per byte, ignoring non-hex characters.
///
/// A trailing unpaired digit is dropped.
pub fn parse_hex_bytes(hex_text: Option<&str>) -> Vec<u8> {
    let Some(text) = hex_text else {
        return Vec::new();
    };
    let digits: Vec<u8> = text
        .chars()
        .filter_map(|c| c.to_digit(16))
        .map(|d| d as u8)
        .collect();
    digits
        .chunks_exact(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect()
}
