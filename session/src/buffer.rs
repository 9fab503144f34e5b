//! Reusable outbound frame buffers.
//!
//! An [`OutgoingBuff`] holds one encoded frame: the 8-byte header, the
//! inline payload bytes, and optionally a tail streamed from a
//! [`TraceSource`] continuator so large payloads never fully materialize.
//! Buffers cycle through the pool (`empty` → filled → `full` → sending →
//! `empty`) and keep their backing allocation across reuse.

use std::io;
use std::sync::Arc;

use daqhist_wire::{begin_header, finish_header, Opcode, HEADER_SIZE};

use crate::error::EngineError;
use crate::traits::TraceSource;

/// Segment descriptor attached to one buffer of a segmented transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Offset of this chunk within the full payload
    pub offset: u64,
    /// Chunk size in bytes
    pub size: u64,
    /// Whether this chunk completes the transfer
    pub is_last: bool,
}

struct SourceTail {
    src: Arc<dyn TraceSource>,
    offset: u64,
    len: u64,
    streamed: u64,
}

/// One reusable outbound frame buffer.
pub struct OutgoingBuff {
    data: Vec<u8>,
    sent: usize,
    frame_start: usize,
    finished: bool,
    declared: u64,
    segment: Option<Segment>,
    source: Option<SourceTail>,
}

impl OutgoingBuff {
    /// Create a buffer with the given initial backing capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            sent: 0,
            frame_start: 0,
            finished: false,
            declared: 0,
            segment: None,
            source: None,
        }
    }

    /// Clear the buffer for reuse, keeping the backing allocation and
    /// dropping any continuator reference.
    pub fn reset(&mut self) {
        self.data.clear();
        self.sent = 0;
        self.frame_start = 0;
        self.finished = false;
        self.declared = 0;
        self.segment = None;
        self.source = None;
    }

    /// Start a frame, writing the header with a length placeholder. Any
    /// previous content is discarded; a buffer carries one frame at a time.
    pub fn begin_frame(&mut self, opcode: Opcode) {
        self.reset();
        self.frame_start = begin_header(&mut self.data, opcode);
    }

    /// Inline payload writer, valid between `begin_frame` and
    /// `finish_frame`.
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Attach a continuator tail: `len` bytes starting at `offset` of the
    /// source, streamed after the inline bytes and counted in the frame
    /// length.
    pub fn attach_source(&mut self, src: Arc<dyn TraceSource>, offset: u64, len: u64) {
        self.source = Some(SourceTail {
            src,
            offset,
            len,
            streamed: 0,
        });
    }

    /// Record the segment descriptor for this buffer.
    pub fn set_segment(&mut self, segment: Segment) {
        self.segment = Some(segment);
    }

    /// Segment descriptor, if this buffer belongs to a segmented transfer.
    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    /// Patch the frame length from what was actually written and attached.
    /// Fails if the total payload does not fit the length field; the
    /// buffer stays unsealed and `check_consistent` keeps rejecting it.
    pub fn finish_frame(&mut self) -> Result<(), EngineError> {
        let inline = (self.data.len() - self.frame_start - HEADER_SIZE) as u64;
        let tail = self.source.as_ref().map_or(0, |t| t.len);
        self.declared = inline + tail;
        let len = u32::try_from(self.declared).map_err(|_| EngineError::FrameTooLong {
            declared: self.declared,
        })?;
        finish_header(&mut self.data, self.frame_start, len);
        self.finished = true;
        Ok(())
    }

    /// Whether `finish_frame` has sealed this buffer.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Corruption guard: the declared frame length must equal the bytes
    /// actually present. Violations are fatal to the session.
    pub fn check_consistent(&self) -> Result<(), EngineError> {
        let inline = (self.data.len() - self.frame_start - HEADER_SIZE) as u64;
        let written = inline + self.source.as_ref().map_or(0, |t| t.len);
        if !self.finished || written != self.declared || self.declared > u64::from(u32::MAX) {
            return Err(EngineError::CorruptBuffer {
                declared: self.declared,
                written,
            });
        }
        Ok(())
    }

    /// Total frame size on the wire: header, inline bytes, streamed tail.
    pub fn total_len(&self) -> u64 {
        self.data.len() as u64 + self.source.as_ref().map_or(0, |t| t.len)
    }

    /// Bytes not yet pulled by the transport.
    pub fn remaining(&self) -> u64 {
        let inline = (self.data.len() - self.sent) as u64;
        let tail = self
            .source
            .as_ref()
            .map_or(0, |t| t.len - t.streamed);
        inline + tail
    }

    /// Whether every byte has been handed to the transport.
    pub fn is_drained(&self) -> bool {
        self.remaining() == 0
    }

    /// Pull the next bytes for transmission: inline header/payload first,
    /// then the continuator tail. Advances the sent cursor.
    pub fn read_into(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;

        let inline = self.data.len() - self.sent;
        if inline > 0 {
            let take = inline.min(out.len());
            out[..take].copy_from_slice(&self.data[self.sent..self.sent + take]);
            self.sent += take;
            n += take;
        }

        if n < out.len() {
            if let Some(tail) = &mut self.source {
                let want = ((tail.len - tail.streamed) as usize).min(out.len() - n);
                if want > 0 {
                    let got = tail
                        .src
                        .read_at(tail.offset + tail.streamed, &mut out[n..n + want])?;
                    if got == 0 {
                        // A source that ends short would otherwise leave the
                        // buffer undrained forever.
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "trace source ended {} bytes early",
                                tail.len - tail.streamed
                            ),
                        ));
                    }
                    tail.streamed += got as u64;
                    n += got;
                }
            }
        }

        Ok(n)
    }
}

/// Ephemeral context scoped to one scheduling step, carrying a buffer
/// returned for immediate reuse without a round trip through the pool.
#[derive(Default)]
pub struct RecycledBuffContext {
    slot: Option<OutgoingBuff>,
}

impl RecycledBuffContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the context holds a buffer.
    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    /// Take the held buffer, if any.
    pub fn take(&mut self) -> Option<OutgoingBuff> {
        self.slot.take()
    }

    /// Park a buffer for immediate reuse. The context holds at most one;
    /// callers route extra buffers back to the pool instead.
    pub fn park(&mut self, buf: OutgoingBuff) {
        debug_assert!(self.slot.is_none());
        self.slot = Some(buf);
    }

    /// Consume the context, yielding any leftover buffer.
    pub fn into_inner(self) -> Option<OutgoingBuff> {
        self.slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ByteSource(Vec<u8>);

    impl TraceSource for ByteSource {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }
        fn access_options(&self) -> i32 {
            0
        }
        fn read_at(&self, offset: u64, out: &mut [u8]) -> io::Result<usize> {
            let start = offset as usize;
            let take = (self.0.len() - start).min(out.len());
            out[..take].copy_from_slice(&self.0[start..start + take]);
            Ok(take)
        }
    }

    #[test]
    fn test_inline_frame_roundtrip() {
        let mut buf = OutgoingBuff::new(64);
        buf.begin_frame(Opcode::TextReply);
        buf.payload_mut().extend_from_slice(b"hello");
        buf.finish_frame().unwrap();
        buf.check_consistent().unwrap();

        assert_eq!(buf.total_len(), (HEADER_SIZE + 5) as u64);

        let mut out = [0u8; 64];
        let n = buf.read_into(&mut out).unwrap();
        assert_eq!(n, HEADER_SIZE + 5);
        assert!(buf.is_drained());

        // Header reproduced byte-for-byte.
        assert_eq!(out[0], Opcode::TextReply as u8);
        assert_eq!(&out[1..4], &daqhist_wire::MAGIC);
        assert_eq!(u32::from_le_bytes(out[4..8].try_into().unwrap()), 5);
        assert_eq!(&out[8..13], b"hello");
    }

    #[test]
    fn test_source_tail_streaming() {
        let src = Arc::new(ByteSource((0..100u8).collect()));
        let mut buf = OutgoingBuff::new(64);
        buf.begin_frame(Opcode::TraceCome);
        buf.payload_mut().extend_from_slice(b"hdr");
        buf.attach_source(src, 10, 40);
        buf.finish_frame().unwrap();
        buf.check_consistent().unwrap();

        assert_eq!(buf.total_len(), (HEADER_SIZE + 3 + 40) as u64);

        // Drain in small pulls across the inline/tail boundary.
        let mut collected = Vec::new();
        let mut out = [0u8; 7];
        while !buf.is_drained() {
            let n = buf.read_into(&mut out).unwrap();
            collected.extend_from_slice(&out[..n]);
        }
        assert_eq!(collected.len(), HEADER_SIZE + 3 + 40);
        assert_eq!(&collected[HEADER_SIZE..HEADER_SIZE + 3], b"hdr");
        assert_eq!(collected[HEADER_SIZE + 3], 10);
        assert_eq!(*collected.last().unwrap(), 49);
    }

    #[test]
    fn test_corruption_guard() {
        let mut buf = OutgoingBuff::new(64);
        buf.begin_frame(Opcode::TextReply);
        buf.payload_mut().extend_from_slice(b"abc");
        // finish_frame never called: inconsistent.
        assert!(buf.check_consistent().is_err());

        buf.finish_frame().unwrap();
        buf.check_consistent().unwrap();

        // Writing after finish breaks the declared length.
        buf.payload_mut().push(0);
        assert!(matches!(
            buf.check_consistent(),
            Err(EngineError::CorruptBuffer {
                declared: 3,
                written: 4
            })
        ));
    }

    #[test]
    fn test_oversize_payload_rejected() {
        struct HugeSource(u64);

        impl TraceSource for HugeSource {
            fn len(&self) -> u64 {
                self.0
            }
            fn access_options(&self) -> i32 {
                0
            }
            fn read_at(&self, _offset: u64, out: &mut [u8]) -> io::Result<usize> {
                out.fill(0);
                Ok(out.len())
            }
        }

        let tail = 5_000_000_000u64;
        let mut buf = OutgoingBuff::new(16);
        buf.begin_frame(Opcode::TraceCome);
        buf.attach_source(Arc::new(HugeSource(tail)), 0, tail);

        // The length field is 32 bits wide; sealing must fail rather than
        // wrap the declared length.
        assert!(matches!(
            buf.finish_frame(),
            Err(EngineError::FrameTooLong { declared }) if declared == tail
        ));
        assert!(buf.check_consistent().is_err());
    }

    #[test]
    fn test_truncated_source_fails_drain() {
        let src = Arc::new(ByteSource(vec![7u8; 10]));
        let mut buf = OutgoingBuff::new(16);
        buf.begin_frame(Opcode::TraceCome);
        buf.attach_source(src, 0, 40);
        buf.finish_frame().unwrap();

        let mut out = [0u8; 64];
        let n = buf.read_into(&mut out).unwrap();
        assert_eq!(n, HEADER_SIZE + 10);
        assert!(!buf.is_drained());

        // The source has no more bytes but 30 are still owed.
        let err = buf.read_into(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_reset_releases_source() {
        let src = Arc::new(ByteSource(vec![0u8; 16]));
        let mut buf = OutgoingBuff::new(16);
        buf.begin_frame(Opcode::TraceCome);
        buf.attach_source(Arc::clone(&src) as Arc<dyn TraceSource>, 0, 16);
        buf.finish_frame().unwrap();
        assert_eq!(Arc::strong_count(&src), 2);

        buf.reset();
        assert_eq!(Arc::strong_count(&src), 1);
    }
}
