//! Flow-controlled, segmented trace-download scheduling.
//!
//! Requests wait in `pending` (FIFO) or `paused` (data not yet produced).
//! At most one segmented transfer is active at a time; its chunks are
//! emitted across successive scheduling steps, each chunk bounded by the
//! per-tick ceiling derived from the client's advertised link speed.
//! Backlog counters (`hanging_bytes`/`hanging_count`) gate emission, and
//! the moderated-download protocol asks the client for an explicit
//! `DownloadResume` once the backlog crosses the configured threshold.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use daqhist_wire::{
    Opcode, SegmentHeader, TraceReplyHeader, TraceRequestMsg, MAX_BODY_LEN, SIGNAL_ID_MASK,
};

use crate::buffer::{OutgoingBuff, RecycledBuffContext, Segment};
use crate::config::Configuration;
use crate::error::EngineError;
use crate::pool::{BufferPool, ThreadCtx};
use crate::traits::{TraceData, TraceSource, TraceStore, TransportAdapter};

/// Largest trace tail one reply frame may carry, leaving the reply header
/// room under the wire body limit. Payloads above this are segmented even
/// when segmentation is off or the link-speed ceiling is larger.
const REPLY_TAIL_CAP: u64 = MAX_BODY_LEN as u64 - 4096;

/// Identity of one requested trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequest {
    /// Shot name
    pub shot_name: String,
    /// Signal id as requested (option bits in the high byte preserved)
    pub signal_id: i32,
}

impl TraceRequest {
    fn matches(&self, shot: &str, id: i32) -> bool {
        self.shot_name == shot && self.signal_id == id
    }
}

struct ActiveTransfer {
    req: TraceRequest,
    source: Arc<dyn TraceSource>,
    full_size: u64,
    offset: u64,
    chunk_size: u64,
}

/// Per-session trace-download scheduler.
pub struct TraceScheduler {
    pending: VecDeque<TraceRequest>,
    paused: Vec<TraceRequest>,
    active: Option<ActiveTransfer>,
    hanging_bytes: u64,
    hanging_count: u32,
    moderation_outstanding: bool,
    max_queued_bytes: u64,
    max_queued_count: u32,
    moderated_rate: Option<u64>,
    segmentation: bool,
    ceiling: u64,
}

impl TraceScheduler {
    /// Create a scheduler with the configured defaults.
    pub fn new(cfg: &Configuration) -> Self {
        Self {
            pending: VecDeque::new(),
            paused: Vec::new(),
            active: None,
            hanging_bytes: 0,
            hanging_count: 0,
            moderation_outstanding: false,
            max_queued_bytes: cfg.max_queued_bytes,
            max_queued_count: cfg.max_queued_count,
            moderated_rate: cfg.moderated_rate,
            segmentation: cfg.segmentation,
            ceiling: cfg.segment_ceiling.max(1),
        }
    }

    /// Override the per-tick segment ceiling, typically from the link
    /// speed the client advertised at login.
    pub fn set_ceiling(&mut self, ceiling: u64) {
        self.ceiling = ceiling.max(1);
    }

    /// Flow-control gate: nothing new is emitted while this is false.
    pub fn no_pause_out(&self) -> bool {
        !self.moderation_outstanding
            && self.hanging_bytes < self.max_queued_bytes
            && u64::from(self.hanging_count) < u64::from(self.max_queued_count)
    }

    fn contains(&self, shot: &str, id: i32) -> bool {
        self.pending.iter().any(|r| r.matches(shot, id))
            || self.paused.iter().any(|r| r.matches(shot, id))
            || self
                .active
                .as_ref()
                .is_some_and(|a| a.req.matches(shot, id))
    }

    /// Enqueue a trace request unless the identity is already present in
    /// any queue or the active slot.
    pub fn request(&mut self, shot_name: &str, signal_id: i32) {
        if self.contains(shot_name, signal_id) {
            debug!(shot = shot_name, signal_id, "duplicate trace request ignored");
            return;
        }
        self.pending.push_back(TraceRequest {
            shot_name: shot_name.to_owned(),
            signal_id,
        });
    }

    /// Cancel a request: clears a matching active transfer (releasing its
    /// source) and scrubs `pending`/`paused`.
    pub fn refuse(&mut self, shot_name: &str, signal_id: i32) {
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.req.matches(shot_name, signal_id))
        {
            debug!(shot = shot_name, signal_id, "active transfer refused");
            self.active = None;
        }
        self.pending.retain(|r| !r.matches(shot_name, signal_id));
        self.paused.retain(|r| !r.matches(shot_name, signal_id));
    }

    /// Data-updated notification: paused requests for this shot whose
    /// masked id appears in `ids` move back to `pending`. Matched ids are
    /// consumed from `ids` so duplicates are not double-counted. The scan
    /// runs from the tail so in-loop removal stays safe.
    pub fn data_updated(&mut self, shot_name: &str, ids: &mut Vec<i32>) {
        for i in (0..self.paused.len()).rev() {
            if self.paused[i].shot_name != shot_name {
                continue;
            }
            let masked = self.paused[i].signal_id & SIGNAL_ID_MASK;
            if let Some(pos) = ids.iter().position(|id| (id & SIGNAL_ID_MASK) == masked) {
                ids.remove(pos);
                let req = self.paused.remove(i);
                self.pending.push_back(req);
            }
        }
    }

    /// `DownloadResume` from the client: zero the backlog counters and the
    /// moderation-outstanding flag so the next step may emit again.
    pub fn resume_download(&mut self) {
        self.hanging_bytes = 0;
        self.hanging_count = 0;
        self.moderation_outstanding = false;
    }

    /// Drop every queued and active request, releasing any held source.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.paused.clear();
        self.active = None;
    }

    /// Whether a segmented transfer is in progress.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Queued-but-unstarted request count.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Requests parked awaiting a data-updated notification.
    pub fn paused_len(&self) -> usize {
        self.paused.len()
    }

    /// Bytes queued for transmission but not yet confirmed delivered.
    pub fn hanging_bytes(&self) -> u64 {
        self.hanging_bytes
    }

    /// Run one scheduling step: emit reply frames until the queues empty,
    /// the gate closes, no buffer is available, or (with a recycled
    /// context) one item went out.
    ///
    /// `privilege_bits` are OR-ed into each reply's access options.
    pub fn step(
        &mut self,
        pool: &BufferPool,
        transport: &dyn TransportAdapter,
        store: &dyn TraceStore,
        mut recycled: Option<&mut RecycledBuffContext>,
        privilege_bits: i32,
    ) -> Result<(), EngineError> {
        let one_shot = recycled.is_some();
        let mut emitted = 0u32;

        loop {
            if !self.no_pause_out() || (one_shot && emitted > 0) {
                break;
            }

            if self.active.is_none() {
                let Some(req) = self.pending.pop_front() else {
                    break;
                };
                match store.open_trace(&req.shot_name, req.signal_id) {
                    Ok(TraceData::Ready(source)) => {
                        let full = source.len();
                        let limit = if self.segmentation {
                            self.ceiling.min(REPLY_TAIL_CAP)
                        } else {
                            REPLY_TAIL_CAP
                        };
                        if full > limit {
                            let count = full.div_ceil(limit);
                            let chunk = limit.min(full.div_ceil(count)).max(1);
                            self.active = Some(ActiveTransfer {
                                req,
                                source,
                                full_size: full,
                                offset: 0,
                                chunk_size: chunk,
                            });
                            // Chunks emitted from the active slot below.
                        } else {
                            let Some(buf) = pool.get(
                                ThreadCtx::Internal,
                                recycled.as_deref_mut(),
                                true,
                                false,
                                transport,
                            ) else {
                                self.pending.push_front(req);
                                break;
                            };
                            let sent = self.emit_whole(
                                buf,
                                &req,
                                source,
                                full,
                                privilege_bits,
                                pool,
                                transport,
                            )?;
                            self.account(sent);
                            emitted += 1;
                            self.check_moderation(pool, transport)?;
                        }
                        continue;
                    }
                    Ok(TraceData::NotReady) => {
                        debug!(
                            shot = %req.shot_name,
                            signal_id = req.signal_id,
                            "trace not ready, parking request"
                        );
                        self.paused.push(req);
                        continue;
                    }
                    Err(err) => {
                        warn!(
                            shot = %req.shot_name,
                            signal_id = req.signal_id,
                            %err,
                            "trace request failed"
                        );
                        self.emit_refusal(&req, pool, transport, recycled.as_deref_mut())?;
                        continue;
                    }
                }
            }

            // Continue the active segmented transfer.
            let Some(buf) = pool.get(
                ThreadCtx::Internal,
                recycled.as_deref_mut(),
                true,
                false,
                transport,
            ) else {
                break;
            };
            let sent = self.emit_chunk(buf, privilege_bits, pool, transport)?;
            self.account(sent);
            emitted += 1;
            self.check_moderation(pool, transport)?;
        }

        Ok(())
    }

    fn account(&mut self, bytes: u64) {
        self.hanging_bytes += bytes;
        self.hanging_count += 1;
    }

    /// One whole-payload reply, no segment header.
    #[allow(clippy::too_many_arguments)]
    fn emit_whole(
        &mut self,
        mut buf: OutgoingBuff,
        req: &TraceRequest,
        source: Arc<dyn TraceSource>,
        full: u64,
        privilege_bits: i32,
        pool: &BufferPool,
        transport: &dyn TransportAdapter,
    ) -> Result<u64, EngineError> {
        buf.begin_frame(Opcode::TraceCome);
        let header = TraceReplyHeader {
            shot_name: req.shot_name.clone(),
            signal_id: req.signal_id,
            access_options: source.access_options() | privilege_bits,
            segment: None,
        };
        header.encode(buf.payload_mut())?;
        buf.attach_source(source, 0, full);
        buf.set_segment(Segment {
            offset: 0,
            size: full,
            is_last: true,
        });
        buf.finish_frame()?;
        pool.put(buf, ThreadCtx::Internal, transport)?;
        Ok(full)
    }

    /// One chunk of the active segmented transfer; clears the slot and
    /// releases the source on the final chunk.
    fn emit_chunk(
        &mut self,
        mut buf: OutgoingBuff,
        privilege_bits: i32,
        pool: &BufferPool,
        transport: &dyn TransportAdapter,
    ) -> Result<u64, EngineError> {
        let Some(active) = &mut self.active else {
            pool.refuse(buf, None);
            return Ok(0);
        };

        let size = active.chunk_size.min(active.full_size - active.offset);
        let is_last = active.offset + size >= active.full_size;

        buf.begin_frame(Opcode::TraceCome);
        let header = TraceReplyHeader {
            shot_name: active.req.shot_name.clone(),
            signal_id: active.req.signal_id,
            access_options: active.source.access_options() | privilege_bits,
            segment: Some(SegmentHeader {
                full_size: active.full_size as i64,
                offset: active.offset as i64,
            }),
        };
        header.encode(buf.payload_mut())?;
        buf.attach_source(Arc::clone(&active.source), active.offset, size);
        buf.set_segment(Segment {
            offset: active.offset,
            size,
            is_last,
        });
        buf.finish_frame()?;

        active.offset += size;
        if is_last {
            debug!(
                shot = %active.req.shot_name,
                signal_id = active.req.signal_id,
                full_size = active.full_size,
                "segmented transfer complete"
            );
            self.active = None;
        }

        pool.put(buf, ThreadCtx::Internal, transport)?;
        Ok(size)
    }

    /// Application-level refusal reply; the session continues.
    fn emit_refusal(
        &mut self,
        req: &TraceRequest,
        pool: &BufferPool,
        transport: &dyn TransportAdapter,
        recycled: Option<&mut RecycledBuffContext>,
    ) -> Result<(), EngineError> {
        let Some(mut buf) = pool.get(ThreadCtx::Internal, recycled, false, true, transport)
        else {
            warn!(
                shot = %req.shot_name,
                signal_id = req.signal_id,
                "no buffer for refusal reply, dropping"
            );
            return Ok(());
        };
        buf.begin_frame(Opcode::RefuseTrace);
        let msg = TraceRequestMsg {
            shot_name: req.shot_name.clone(),
            ids: vec![req.signal_id],
        };
        msg.encode(buf.payload_mut())?;
        buf.finish_frame()?;
        pool.put(buf, ThreadCtx::Internal, transport)
    }

    /// Once the backlog crosses the moderated-rate threshold, ask the
    /// client to issue an explicit `DownloadResume`. A failed frame build
    /// rolls the flag back so the request is retried next step.
    fn check_moderation(
        &mut self,
        pool: &BufferPool,
        transport: &dyn TransportAdapter,
    ) -> Result<(), EngineError> {
        let Some(rate) = self.moderated_rate else {
            return Ok(());
        };
        if self.hanging_bytes < rate || self.moderation_outstanding {
            return Ok(());
        }

        self.moderation_outstanding = true;
        let Some(mut buf) = pool.get(ThreadCtx::Internal, None, false, true, transport) else {
            self.moderation_outstanding = false;
            return Ok(());
        };
        buf.begin_frame(Opcode::DownloadPause);
        let sealed = buf
            .finish_frame()
            .and_then(|()| pool.put(buf, ThreadCtx::Internal, transport));
        match sealed {
            Ok(()) => {
                debug!(hanging_bytes = self.hanging_bytes, "moderation pause requested");
                Ok(())
            }
            Err(err) => {
                self.moderation_outstanding = false;
                Err(err)
            }
        }
    }
}
