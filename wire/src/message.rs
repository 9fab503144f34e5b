//! Request and reply payload layouts.
//!
//! These codecs cover the payload bytes inside a frame; the 8-byte frame
//! header itself is handled by [`crate::frame`].

use bitflags::bitflags;

use crate::codec::{
    get_i32, get_i64, get_pascal, get_u32, put_pascal, CREDENTIAL_MAX, FILE_NAME_MAX,
    SHOT_NAME_MAX, TEXT_MAX,
};
use crate::WireError;

/// Mask isolating the numeric part of a signal id; the high byte carries
/// per-request option bits and is ignored when matching data-updated
/// notifications.
pub const SIGNAL_ID_MASK: i32 = 0x00FF_FFFF;

bitflags! {
    /// Access option bits carried in trace and file-part replies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessOptions: i32 {
        /// Data may still change (replication volatile bit)
        const VOLATILE = 1 << 0;
        /// Caller has write access to the shot
        const WRITABLE = 1 << 1;
        /// Data was served from an archive tier
        const ARCHIVED = 1 << 2;
    }
}

/// Login request payload: credentials plus the client's advertised link
/// speed in KiB/s, which drives the per-tick segment ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginMsg {
    /// User name
    pub user: String,
    /// Password
    pub password: String,
    /// Advertised link speed, KiB/s (0 = unknown)
    pub link_speed_kib: u32,
}

impl LoginMsg {
    /// Encode into a frame body.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        put_pascal(buf, &self.user, CREDENTIAL_MAX)?;
        put_pascal(buf, &self.password, CREDENTIAL_MAX)?;
        buf.extend_from_slice(&self.link_speed_kib.to_le_bytes());
        Ok(())
    }

    /// Decode from a frame body.
    pub fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let user = get_pascal(&mut body, CREDENTIAL_MAX)?;
        let password = get_pascal(&mut body, CREDENTIAL_MAX)?;
        let link_speed_kib = get_u32(&mut body)?;
        Ok(Self {
            user,
            password,
            link_speed_kib,
        })
    }
}

/// Login reply payload: result code (0 = ok) and a short text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginReplyMsg {
    /// 0 on success, nonzero application error code otherwise
    pub result: i32,
    /// Human-readable result text
    pub message: String,
}

impl LoginReplyMsg {
    /// Encode into a frame body.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.extend_from_slice(&self.result.to_le_bytes());
        put_pascal(buf, &self.message, TEXT_MAX)
    }

    /// Decode from a frame body.
    pub fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let result = get_i32(&mut body)?;
        let message = get_pascal(&mut body, TEXT_MAX)?;
        Ok(Self { result, message })
    }
}

/// Trace request payload, shared by `TraceCall` and `RefuseTrace`:
/// shot name plus a list of signal ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequestMsg {
    /// Shot name
    pub shot_name: String,
    /// Requested signal ids (option bits in the high byte)
    pub ids: Vec<i32>,
}

impl TraceRequestMsg {
    /// Encode into a frame body.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        put_pascal(buf, &self.shot_name, SHOT_NAME_MAX)?;
        buf.extend_from_slice(&(self.ids.len() as u32).to_le_bytes());
        for id in &self.ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        Ok(())
    }

    /// Decode from a frame body.
    pub fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let shot_name = get_pascal(&mut body, SHOT_NAME_MAX)?;
        let count = get_u32(&mut body)? as usize;
        let mut ids = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            ids.push(get_i32(&mut body)?);
        }
        Ok(Self { shot_name, ids })
    }
}

/// Segment descriptor fields present in a segmented trace reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Total size of the logical payload
    pub full_size: i64,
    /// Offset of this segment within the payload
    pub offset: i64,
}

/// Trace reply header preceding the payload bytes of a `TraceCome` frame.
///
/// Layout: `shotName:pascal(15), signalId:i32, accessOptions:i32` and, when
/// segmented, `fullSize:i64, segmentOffset:i64, reserved:i64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReplyHeader {
    /// Shot name
    pub shot_name: String,
    /// Signal id as requested
    pub signal_id: i32,
    /// Access option bits
    pub access_options: i32,
    /// Segment fields; `None` when the whole payload follows
    pub segment: Option<SegmentHeader>,
}

impl TraceReplyHeader {
    /// Encode into a frame body; payload bytes follow.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        put_pascal(buf, &self.shot_name, SHOT_NAME_MAX)?;
        buf.extend_from_slice(&self.signal_id.to_le_bytes());
        buf.extend_from_slice(&self.access_options.to_le_bytes());
        if let Some(seg) = &self.segment {
            buf.extend_from_slice(&seg.full_size.to_le_bytes());
            buf.extend_from_slice(&seg.offset.to_le_bytes());
            buf.extend_from_slice(&0i64.to_le_bytes());
        }
        Ok(())
    }

    /// Decode a header, returning it and the remaining payload bytes.
    ///
    /// `segmented` must be known from context (the request that solicited
    /// this reply); the wire layout itself does not flag it.
    pub fn decode(mut body: &[u8], segmented: bool) -> Result<(Self, &[u8]), WireError> {
        let shot_name = get_pascal(&mut body, SHOT_NAME_MAX)?;
        let signal_id = get_i32(&mut body)?;
        let access_options = get_i32(&mut body)?;
        let segment = if segmented {
            let full_size = get_i64(&mut body)?;
            let offset = get_i64(&mut body)?;
            let _reserved = get_i64(&mut body)?;
            Some(SegmentHeader { full_size, offset })
        } else {
            None
        };
        Ok((
            Self {
                shot_name,
                signal_id,
                access_options,
                segment,
            },
            body,
        ))
    }
}

/// Replication file-part header preceding the payload of a `FilePart` frame.
///
/// Layout: `shotName:pascal(15), fileName:pascal(15), reserved:i32,
/// accessOptions:i32, fullSize:i64, segOffset:i64, reserved:i64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePartHeader {
    /// Shot name
    pub shot_name: String,
    /// File name within the shot
    pub file_name: String,
    /// Access option bits (volatile bit marks still-changing files)
    pub access_options: i32,
    /// Total file size
    pub full_size: i64,
    /// Offset of this part
    pub seg_offset: i64,
}

impl FilePartHeader {
    /// Encode into a frame body; part bytes follow.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        put_pascal(buf, &self.shot_name, SHOT_NAME_MAX)?;
        put_pascal(buf, &self.file_name, FILE_NAME_MAX)?;
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&self.access_options.to_le_bytes());
        buf.extend_from_slice(&self.full_size.to_le_bytes());
        buf.extend_from_slice(&self.seg_offset.to_le_bytes());
        buf.extend_from_slice(&0i64.to_le_bytes());
        Ok(())
    }

    /// Decode a header, returning it and the remaining part bytes.
    pub fn decode(mut body: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let shot_name = get_pascal(&mut body, SHOT_NAME_MAX)?;
        let file_name = get_pascal(&mut body, FILE_NAME_MAX)?;
        let _reserved = get_i32(&mut body)?;
        let access_options = get_i32(&mut body)?;
        let full_size = get_i64(&mut body)?;
        let seg_offset = get_i64(&mut body)?;
        let _reserved2 = get_i64(&mut body)?;
        Ok((
            Self {
                shot_name,
                file_name,
                access_options,
                full_size,
                seg_offset,
            },
            body,
        ))
    }
}

/// Encode a JSON-with-attachment body: `reserved:u32=0, jsonLength:u32-LE`,
/// JSON bytes, then attachment bytes.
pub fn encode_json_with_attachment(buf: &mut Vec<u8>, json: &[u8], attachment: &[u8]) {
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&(json.len() as u32).to_le_bytes());
    buf.extend_from_slice(json);
    buf.extend_from_slice(attachment);
}

/// Split a JSON-with-attachment body into `(json, attachment)`.
pub fn decode_json_with_attachment(mut body: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    let reserved = get_u32(&mut body)?;
    if reserved != 0 {
        return Err(WireError::Reserved);
    }
    let json_len = get_u32(&mut body)? as usize;
    if body.len() < json_len {
        return Err(WireError::JsonEnvelope);
    }
    Ok(body.split_at(json_len))
}
