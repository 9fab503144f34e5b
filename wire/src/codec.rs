//! Payload field codecs: Pascal strings and checked little-endian readers.
//!
//! All multi-byte integers in payloads are little-endian. Short strings use
//! Pascal encoding: a 1-byte length followed by raw bytes, with a per-field
//! maximum enforced on both encode and decode.

use bytes::Buf;

use crate::WireError;

/// Maximum shot name length.
pub const SHOT_NAME_MAX: usize = 15;
/// Maximum replication file name length.
pub const FILE_NAME_MAX: usize = 15;
/// Maximum user/password field length.
pub const CREDENTIAL_MAX: usize = 20;
/// Maximum free-form text field length.
pub const TEXT_MAX: usize = 254;

/// Append a Pascal string, enforcing the field maximum.
pub fn put_pascal(buf: &mut Vec<u8>, s: &str, max: usize) -> Result<(), WireError> {
    let bytes = s.as_bytes();
    if bytes.len() > max {
        return Err(WireError::StringTooLong {
            len: bytes.len(),
            max,
        });
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Read a Pascal string, enforcing the field maximum.
pub fn get_pascal(buf: &mut &[u8], max: usize) -> Result<String, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u8() as usize;
    if len > max {
        return Err(WireError::StringTooLong { len, max });
    }
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| WireError::StringUtf8)?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

/// Read a little-endian u32, checking for truncation.
pub fn get_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32_le())
}

/// Read a little-endian i32, checking for truncation.
pub fn get_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_i32_le())
}

/// Read a little-endian i64, checking for truncation.
pub fn get_i64(buf: &mut &[u8]) -> Result<i64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_i64_le())
}
