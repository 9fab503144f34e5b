//! Protocol opcodes.

use serde::{Deserialize, Serialize};

/// Frame opcodes as defined by the historian wire protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// Client login request
    Login = 0x01,
    /// Login result reply
    LoginReply = 0x02,
    /// Application-level keepalive ping
    Ping = 0x03,
    /// Keepalive acknowledgement
    KeepConnected = 0x04,
    /// Free-form text/result reply for recovered application errors
    TextReply = 0x05,
    /// Request one or more signal traces of a shot
    TraceCall = 0x10,
    /// Trace data reply (whole payload or one segment)
    TraceCome = 0x11,
    /// Cancel previously requested traces
    RefuseTrace = 0x12,
    /// Server asks the client to issue an explicit download resume
    DownloadPause = 0x13,
    /// Client resumes a moderated download
    DownloadResume = 0x14,
    /// Raw JSON document (replication/control envelope)
    Json = 0x20,
    /// JSON document with trailing binary attachment
    JsonWithAttachment = 0x21,
    /// Replication file part
    FilePart = 0x22,
}

impl TryFrom<u8> for Opcode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::Login),
            0x02 => Ok(Opcode::LoginReply),
            0x03 => Ok(Opcode::Ping),
            0x04 => Ok(Opcode::KeepConnected),
            0x05 => Ok(Opcode::TextReply),
            0x10 => Ok(Opcode::TraceCall),
            0x11 => Ok(Opcode::TraceCome),
            0x12 => Ok(Opcode::RefuseTrace),
            0x13 => Ok(Opcode::DownloadPause),
            0x14 => Ok(Opcode::DownloadResume),
            0x20 => Ok(Opcode::Json),
            0x21 => Ok(Opcode::JsonWithAttachment),
            0x22 => Ok(Opcode::FilePart),
            _ => Err(crate::WireError::Opcode(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::try_from(0x01).unwrap(), Opcode::Login);
        assert_eq!(Opcode::try_from(0x11).unwrap(), Opcode::TraceCome);
        assert_eq!(Opcode::try_from(0x22).unwrap(), Opcode::FilePart);
        assert!(Opcode::try_from(0xFF).is_err());
    }
}
