//! Wire protocol framing and codecs for the historian session engine.
//!
//! This crate implements the byte layer of the historian protocol: the
//! 8-byte frame header, the incremental frame decoder, Pascal string and
//! little-endian field codecs, and the request/reply payload layouts used
//! by trace download and replication traffic.
//!
//! ## Wire Format
//!
//! ```text
//! +---------------------+------------------------------+
//! | opcode: u8          | frame type                   |
//! +---------------------+------------------------------+
//! | signature: 3 bytes  | fixed magic b"DAQ"           |
//! +---------------------+------------------------------+
//! | length: u32-LE      | payload byte count           |
//! +---------------------+------------------------------+
//! | payload             | opcode-specific, see message |
//! +---------------------+------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod opcode;

pub use codec::{
    get_i32, get_i64, get_pascal, get_u32, put_pascal, CREDENTIAL_MAX, FILE_NAME_MAX,
    SHOT_NAME_MAX, TEXT_MAX,
};
pub use error::WireError;
pub use frame::{
    begin_header, finish_header, FrameDecoder, FrameSink, HEADER_SIZE, MAGIC, MAX_BODY_LEN,
};
pub use message::{
    decode_json_with_attachment, encode_json_with_attachment, AccessOptions, FilePartHeader,
    LoginMsg, LoginReplyMsg, SegmentHeader, TraceReplyHeader, TraceRequestMsg, SIGNAL_ID_MASK,
};
pub use opcode::Opcode;
