//! Small wire codecs: unsigned varints and SSH exec payloads.
//!
//! Varints are unsigned LEB128, 7 bits per byte, least significant group
//! first, high bit set on every byte but the last. A `u64` takes at most
//! [`MAX_UVARINT_LEN`] bytes.

use crate::error::{LoginError, LoginResult};

/// Maximum encoded length of a `u64` varint.
pub const MAX_UVARINT_LEN: usize = 10;

/// Encode `value` as a minimal unsigned varint.
pub fn put_uvarint(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_UVARINT_LEN);
    let mut v = value;
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
    out
}

/// Decode an unsigned varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// buffer ends mid-varint or the value overflows 64 bits. Trailing bytes
/// after the varint are left alone.
pub fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if i == MAX_UVARINT_LEN {
            return None;
        }
        if b < 0x80 {
            if i == MAX_UVARINT_LEN - 1 && b > 1 {
                return None;
            }
            return Some((value | (u64::from(b) << shift), i + 1));
        }
        value |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    None
}

/// Extract the command string from an `exec` request payload.
///
/// The payload is an SSH `string`: a big-endian `u32` length followed by
/// that many bytes.
pub fn exec_command(payload: &[u8]) -> LoginResult<&[u8]> {
    if payload.len() < 4 {
        return Err(LoginError::MalformedRequest(format!(
            "exec payload too short: {} bytes",
            payload.len()
        )));
    }
    let (header, rest) = payload.split_at(4);
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    rest.get(..len).ok_or_else(|| {
        LoginError::MalformedRequest(format!(
            "exec command length {len} exceeds payload ({} bytes)",
            rest.len()
        ))
    })
}

/// Build an `exec` request payload for `command`.
pub fn exec_payload(command: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + command.len());
    payload.extend_from_slice(&(command.len() as u32).to_be_bytes());
    payload.extend_from_slice(command);
    payload
}
