//! Engine and collaborator error types.

use thiserror::Error;

/// Fatal engine errors; any of these terminates the session.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Framing or payload decoding failure
    #[error("framing: {0}")]
    Wire(#[from] daqhist_wire::WireError),

    /// A filled buffer's declared frame length does not match the bytes
    /// actually written (corruption guard)
    #[error("outbound buffer corrupt: declared {declared}, written {written}")]
    CorruptBuffer {
        /// Length recorded in the frame header
        declared: u64,
        /// Bytes actually present
        written: u64,
    },

    /// A frame's payload cannot be represented in the wire length field
    #[error("frame too long: {declared} bytes")]
    FrameTooLong {
        /// Payload length that was about to be declared
        declared: u64,
    },

    /// Transport-level I/O failure
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

/// Errors reported by the trace/signal storage collaborator.
///
/// These are application-level: they are reported to the client inside a
/// reply frame and the session continues.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No such shot or signal
    #[error("trace not found: {shot}/{id}")]
    NotFound {
        /// Shot name
        shot: String,
        /// Signal id
        id: i32,
    },

    /// Caller lacks access to the shot
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Storage I/O failure
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the authentication collaborator.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Unknown user or wrong password
    #[error("bad credentials")]
    BadCredentials,

    /// Account exists but may not connect
    #[error("account disabled")]
    Disabled,
}
