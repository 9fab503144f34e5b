//! Wire protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding protocol frames.
///
/// Framing-level variants (`BadSignature`, `Oversize`) are fatal to the
/// session; the rest surface as malformed sub-fields of a single frame,
/// which the session also treats as fatal per the protocol contract.
#[derive(Error, Debug)]
pub enum WireError {
    /// Signature bytes did not match the protocol magic
    #[error("bad frame signature {0:02x?}")]
    BadSignature([u8; 3]),

    /// Declared body length exceeds the protocol limit
    #[error("frame length {0} exceeds limit")]
    Oversize(u32),

    /// Ran out of bytes while decoding a payload field
    #[error("truncated payload")]
    Truncated,

    /// String exceeds its per-field maximum length
    #[error("string length {len} exceeds field maximum {max}")]
    StringTooLong {
        /// Actual string length
        len: usize,
        /// Field maximum
        max: usize,
    },

    /// Pascal string bytes are not valid UTF-8
    #[error("string field is not valid utf-8")]
    StringUtf8,

    /// Unknown opcode byte
    #[error("unknown opcode {0:#04x}")]
    Opcode(u8),

    /// Reserved field carried a nonzero value
    #[error("reserved field nonzero")]
    Reserved,

    /// JSON envelope structure is malformed
    #[error("malformed json envelope")]
    JsonEnvelope,
}
