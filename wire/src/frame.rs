//! Incremental frame decoding for the historian wire protocol.
//!
//! A frame on the wire is `opcode:u8, signature:3 bytes, length:u32-LE,
//! payload:length bytes`. The decoder is a three-state machine (`Sign`,
//! `Len`, `Body`) that accepts arbitrary fragmentation, down to one byte
//! per feed call, and dispatches each completed frame synchronously to a
//! [`FrameSink`]. It is driven by exactly one logical thread.

use crate::{Opcode, WireError};

/// Fixed 3-byte frame signature following the opcode.
pub const MAGIC: [u8; 3] = *b"DAQ";

/// Frame header size: opcode + signature + little-endian length.
pub const HEADER_SIZE: usize = 8;

/// Hard limit on a declared body length (256 MiB).
pub const MAX_BODY_LEN: u32 = 256 * 1024 * 1024;

/// Receiver for decoded frames.
///
/// `on_frame` runs synchronously on the decoding thread; it may enqueue
/// outbound buffers before returning. An error aborts decoding and is
/// fatal to the session.
pub trait FrameSink {
    /// Called when the trailing length header of a frame completes.
    ///
    /// Sessions use this to refresh last-activity time even while a large
    /// body is still trickling in.
    fn on_length(&mut self) {}

    /// Called once per fully accumulated frame.
    fn on_frame(&mut self, opcode: u8, body: &[u8]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sign,
    Len,
    Body,
}

/// Incremental parser turning raw inbound bytes into discrete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    scratch: [u8; 4],
    have: usize,
    opcode: u8,
    need: usize,
    body: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder positioned at a frame boundary.
    pub fn new() -> Self {
        Self {
            state: State::Sign,
            scratch: [0; 4],
            have: 0,
            opcode: 0,
            need: 0,
            body: Vec::new(),
        }
    }

    /// Feed raw inbound bytes, dispatching every frame that completes.
    ///
    /// Partial frames are carried across calls; a half-received frame waits
    /// indefinitely for more bytes (session-level keepalive is the only
    /// timeout). Framing errors are fatal and leave the decoder unusable.
    pub fn feed<S: FrameSink>(&mut self, mut input: &[u8], sink: &mut S) -> anyhow::Result<()> {
        while !input.is_empty() {
            match self.state {
                State::Sign => {
                    let take = (4 - self.have).min(input.len());
                    self.scratch[self.have..self.have + take].copy_from_slice(&input[..take]);
                    self.have += take;
                    input = &input[take..];

                    if self.have == 4 {
                        let sig = [self.scratch[1], self.scratch[2], self.scratch[3]];
                        if sig != MAGIC {
                            return Err(WireError::BadSignature(sig).into());
                        }
                        self.opcode = self.scratch[0];
                        self.have = 0;
                        self.state = State::Len;
                    }
                }

                State::Len => {
                    let take = (4 - self.have).min(input.len());
                    self.scratch[self.have..self.have + take].copy_from_slice(&input[..take]);
                    self.have += take;
                    input = &input[take..];

                    if self.have == 4 {
                        let len = u32::from_le_bytes(self.scratch);
                        if len > MAX_BODY_LEN {
                            return Err(WireError::Oversize(len).into());
                        }
                        sink.on_length();

                        self.have = 0;
                        self.need = len as usize;
                        // Grow-only reuse: clear keeps prior capacity.
                        self.body.clear();
                        self.body.reserve(self.need);

                        if self.need == 0 {
                            sink.on_frame(self.opcode, &[])?;
                            self.state = State::Sign;
                        } else {
                            self.state = State::Body;
                        }
                    }
                }

                State::Body => {
                    let take = (self.need - self.body.len()).min(input.len());
                    self.body.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    if self.body.len() == self.need {
                        sink.on_frame(self.opcode, &self.body)?;
                        self.state = State::Sign;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Append a frame header with a zero length placeholder.
///
/// Returns the index of the opcode byte so the length can be patched once
/// the payload is complete.
pub fn begin_header(buf: &mut Vec<u8>, opcode: Opcode) -> usize {
    let start = buf.len();
    buf.push(opcode as u8);
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&0u32.to_le_bytes());
    start
}

/// Patch the little-endian length field of a header written by
/// [`begin_header`].
pub fn finish_header(buf: &mut [u8], frame_start: usize, body_len: u32) {
    buf[frame_start + 4..frame_start + 8].copy_from_slice(&body_len.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collector {
        frames: Vec<(u8, Vec<u8>)>,
        lengths: usize,
    }

    impl FrameSink for Collector {
        fn on_length(&mut self) {
            self.lengths += 1;
        }

        fn on_frame(&mut self, opcode: u8, body: &[u8]) -> anyhow::Result<()> {
            self.frames.push((opcode, body.to_vec()));
            Ok(())
        }
    }

    fn make_frame(opcode: Opcode, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let start = begin_header(&mut buf, opcode);
        buf.extend_from_slice(body);
        finish_header(&mut buf, start, body.len() as u32);
        buf
    }

    #[test]
    fn test_single_frame() {
        let bytes = make_frame(Opcode::TraceCall, b"payload");
        let mut decoder = FrameDecoder::new();
        let mut sink = Collector::default();

        decoder.feed(&bytes, &mut sink).unwrap();

        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0].0, Opcode::TraceCall as u8);
        assert_eq!(sink.frames[0].1, b"payload");
        assert_eq!(sink.lengths, 1);
    }

    #[test]
    fn test_fragmentation_invariance() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&make_frame(Opcode::Login, b"abc"));
        stream.extend_from_slice(&make_frame(Opcode::Ping, b""));
        stream.extend_from_slice(&make_frame(Opcode::Json, &vec![0x7B; 1000]));

        let mut whole = Collector::default();
        FrameDecoder::new().feed(&stream, &mut whole).unwrap();

        // One byte at a time must yield identical dispatches.
        let mut trickle = Collector::default();
        let mut decoder = FrameDecoder::new();
        for b in &stream {
            decoder.feed(std::slice::from_ref(b), &mut trickle).unwrap();
        }

        assert_eq!(whole.frames.len(), 3);
        assert_eq!(whole.frames, trickle.frames);
    }

    #[test]
    fn test_zero_length_body() {
        let bytes = make_frame(Opcode::KeepConnected, b"");
        let mut sink = Collector::default();
        FrameDecoder::new().feed(&bytes, &mut sink).unwrap();

        assert_eq!(sink.frames.len(), 1);
        assert!(sink.frames[0].1.is_empty());
    }

    #[test]
    fn test_bad_signature_is_fatal() {
        let mut bytes = make_frame(Opcode::Ping, b"");
        bytes[2] ^= 0xFF;

        let mut sink = Collector::default();
        let err = FrameDecoder::new().feed(&bytes, &mut sink).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WireError>(),
            Some(WireError::BadSignature(_))
        ));
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let mut bytes = make_frame(Opcode::Json, b"");
        bytes[4..8].copy_from_slice(&(MAX_BODY_LEN + 1).to_le_bytes());

        let mut sink = Collector::default();
        let err = FrameDecoder::new().feed(&bytes, &mut sink).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WireError>(),
            Some(WireError::Oversize(_))
        ));
    }

    #[test]
    fn test_body_buffer_reuse_across_frames() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&make_frame(Opcode::Json, &vec![1u8; 4096]));
        stream.extend_from_slice(&make_frame(Opcode::Json, &vec![2u8; 16]));

        let mut sink = Collector::default();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&stream, &mut sink).unwrap();

        assert_eq!(sink.frames[0].1.len(), 4096);
        assert_eq!(sink.frames[1].1.len(), 16);
        // Prior capacity is retained for the smaller follow-up body.
        assert!(decoder.body.capacity() >= 4096);
    }
}
