//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Every message in this crate is built from the same handful of wire types:
//!
//! ```text
//! byte       single octet
//! boolean    single octet, 0 = FALSE, anything else = TRUE
//! uint32     4 octets, big-endian
//! string     uint32 length || bytes
//! mpint      string holding a two's complement big-endian integer
//! name-list  string holding comma-separated ASCII names
//! ```
//!
//! Readers take the input slice plus an `offset` cursor that advances past
//! whatever was consumed, so a message parser reads its fields in order.

use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};

/// Writes a `string` from UTF-8 text.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_bytes(buf, s.as_bytes());
}

/// Writes a `string` from raw bytes.
pub fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes a `boolean`.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a `name-list`.
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    write_string(buf, &names.join(","));
}

/// Writes an unsigned big-endian magnitude as an `mpint`.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    write_bytes(buf, &encode_mpint(magnitude));
}

/// Encodes an unsigned big-endian magnitude as mpint contents (no length prefix).
///
/// Leading zeros are stripped and a zero byte is prepended when the high
/// bit is set so the value stays positive.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed[0] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Reads a single `byte`.
pub fn read_u8(data: &[u8], offset: &mut usize) -> KeelResult<u8> {
    let byte = *data.get(*offset).ok_or_else(|| {
        KeelError::Protocol(format!("Cannot read byte at offset {}", offset))
    })?;
    *offset += 1;
    Ok(byte)
}

/// Reads a `boolean`.
pub fn read_bool(data: &[u8], offset: &mut usize) -> KeelResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads a `uint32`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> KeelResult<u32> {
    if *offset + 4 > data.len() {
        return Err(KeelError::Protocol(format!(
            "Cannot read uint32 at offset {}",
            offset
        )));
    }

    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(value)
}

/// Reads a `string` as raw bytes.
pub fn read_bytes(data: &[u8], offset: &mut usize) -> KeelResult<Vec<u8>> {
    let length = read_u32(data, offset)? as usize;

    if length > data.len() - *offset {
        return Err(KeelError::Protocol(format!(
            "Data truncated: expected {} bytes at offset {}",
            length, offset
        )));
    }

    let bytes = data[*offset..*offset + length].to_vec();
    *offset += length;
    Ok(bytes)
}

/// Reads a `string` that must be valid UTF-8.
pub fn read_string(data: &[u8], offset: &mut usize) -> KeelResult<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| KeelError::Protocol("String contains invalid UTF-8".to_string()))
}

/// Reads a `name-list`. An empty string yields an empty list.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> KeelResult<Vec<String>> {
    let joined = read_string(data, offset)?;
    if joined.is_empty() {
        return Ok(Vec::new());
    }
    Ok(joined.split(',').map(str::to_string).collect())
}

/// Reads a non-negative `mpint` and returns its big-endian magnitude.
pub fn read_mpint(data: &[u8], offset: &mut usize) -> KeelResult<Vec<u8>> {
    let raw = read_bytes(data, offset)?;
    if raw.first().is_some_and(|b| b & 0x80 != 0) {
        return Err(KeelError::Protocol("Negative mpint".to_string()));
    }
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
    Ok(raw[start..].to_vec())
}

/// Checks that the first byte of `data` is the expected message number.
pub fn expect_message(data: &[u8], expected: u8, name: &str) -> KeelResult<()> {
    match data.first() {
        Some(&t) if t == expected => Ok(()),
        Some(&t) => Err(KeelError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected, name, t
        ))),
        None => Err(KeelError::Protocol(format!(
            "Empty payload, expected {} ({})",
            expected, name
        ))),
    }
}
