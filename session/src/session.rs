//! Session façade composing the engine components.
//!
//! A [`Session`] owns one connection's protocol state: frame decoder,
//! buffer pool, trace scheduler, keepalive supervisor, and the pluggable
//! application protocol. The transport drives it through two entry
//! points: [`Session::feed`] with raw inbound bytes and [`Session::tick`]
//! on a periodic cadence. External producers get a clonable
//! [`ExternalHandle`] and never touch the session directly.

use std::mem;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use daqhist_wire::{FrameDecoder, FrameSink, Opcode};

use crate::buffer::RecycledBuffContext;
use crate::config::Configuration;
use crate::events::{EventQueue, ProducerEvent};
use crate::keepalive::{KeepaliveAction, KeepaliveSupervisor, OOB_REQUEST_PREFIX};
use crate::pool::{BufferPool, ThreadCtx};
use crate::protocol::{AppProtocol, ProtoCx};
use crate::trace::TraceScheduler;
use crate::traits::{AccessControl, Privileges, TraceStore, TransportAdapter};

/// Traffic counters, logged at teardown.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    /// Frames decoded from the peer
    pub frames_in: u64,
    /// Raw bytes fed to the decoder
    pub bytes_in: u64,
    /// Frames fully handed to the transport
    pub frames_out: u64,
    /// Bytes handed to the transport
    pub bytes_out: u64,
}

/// One logical client connection's protocol-engine state.
pub struct Session {
    cfg: Configuration,
    transport: Arc<dyn TransportAdapter>,
    store: Arc<dyn TraceStore>,
    auth: Arc<dyn AccessControl>,
    pool: Arc<BufferPool>,
    events: Arc<EventQueue>,
    decoder: FrameDecoder,
    scheduler: TraceScheduler,
    keepalive: KeepaliveSupervisor,
    privileges: Privileges,
    protocol: Option<Box<dyn AppProtocol>>,
    cancelled: bool,
    disconnect_reason: Option<String>,
    stats: SessionStats,
}

struct SessionSink<'a> {
    session: &'a mut Session,
    now: Instant,
}

impl FrameSink for SessionSink<'_> {
    fn on_length(&mut self) {
        self.session.keepalive.touch(self.now);
    }

    fn on_frame(&mut self, opcode: u8, body: &[u8]) -> anyhow::Result<()> {
        self.session.handle_frame(self.now, opcode, body)
    }
}

impl Session {
    /// Create a session for a freshly accepted connection.
    pub fn new(
        cfg: Configuration,
        transport: Arc<dyn TransportAdapter>,
        store: Arc<dyn TraceStore>,
        auth: Arc<dyn AccessControl>,
        protocol: Box<dyn AppProtocol>,
        now: Instant,
    ) -> Self {
        let pool = Arc::new(BufferPool::new(&cfg));
        let events = Arc::new(EventQueue::new(cfg.event_queue_depth));
        let scheduler = TraceScheduler::new(&cfg);
        let keepalive = KeepaliveSupervisor::new(&cfg, now);
        Self {
            cfg,
            transport,
            store,
            auth,
            pool,
            events,
            decoder: FrameDecoder::new(),
            scheduler,
            keepalive,
            privileges: Privileges::default(),
            protocol: Some(protocol),
            cancelled: false,
            disconnect_reason: None,
            stats: SessionStats::default(),
        }
    }

    /// Handle for external producers; clonable, never blocks the session.
    pub fn external_handle(&self) -> ExternalHandle {
        ExternalHandle {
            pool: Arc::clone(&self.pool),
            events: Arc::clone(&self.events),
            transport: Arc::clone(&self.transport),
        }
    }

    /// Whether teardown has run.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The sticky disconnect reason, once one is recorded.
    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    /// Traffic counters.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Feed raw inbound bytes through the decoder. A framing error is
    /// fatal: the session cancels itself and the error is returned.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> anyhow::Result<()> {
        if self.cancelled {
            return Ok(());
        }
        self.stats.bytes_in += bytes.len() as u64;

        let mut decoder = mem::take(&mut self.decoder);
        let result = decoder.feed(bytes, &mut SessionSink { session: self, now });
        self.decoder = decoder;

        if let Err(err) = result {
            self.fail(&format!("protocol error: {err:#}"));
            return Err(err);
        }
        Ok(())
    }

    /// Ack token received on the transport's out-of-band channel.
    pub fn oob_received(&mut self, token: &str, now: Instant) {
        self.keepalive.ack_oob(token, now);
    }

    /// One scheduling tick: drain external events, poll keepalive, run a
    /// scheduler step, then push the full queue through the transport.
    pub fn tick(&mut self, now: Instant) {
        if self.cancelled {
            return;
        }

        for event in self.events.drain() {
            match event {
                ProducerEvent::DataUpdated {
                    shot_name,
                    mut signal_ids,
                } => self.scheduler.data_updated(&shot_name, &mut signal_ids),
            }
        }

        // Keepalive goes first so a due ping claims a buffer before the
        // scheduler can soak the pool with trace chunks.
        match self.keepalive.poll(now, self.pool.full_len() == 0) {
            KeepaliveAction::None => {}
            KeepaliveAction::SendPing { seq } => self.send_ping(seq),
            KeepaliveAction::Terminate(reason) => {
                self.cancel(Some(&reason));
                return;
            }
        }
        if self.cancelled {
            return;
        }

        if self.allow_output() {
            let bits = self.privileges.access_options;
            if let Err(err) = self.scheduler.step(
                &self.pool,
                self.transport.as_ref(),
                self.store.as_ref(),
                None,
                bits,
            ) {
                self.fail(&format!("scheduling: {err}"));
                return;
            }
        }

        self.drain_output();
    }

    /// Cooperative teardown. Idempotent; the first recorded reason wins.
    pub fn cancel(&mut self, reason: Option<&str>) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if self.disconnect_reason.is_none() {
            match reason {
                Some(r) => self.disconnect_reason = Some(r.to_owned()),
                // Silent disconnects stay debuggable.
                None => trace!("session cancelled without explicit reason"),
            }
        }
        self.scheduler.clear();
        self.pool.drain();
        self.transport.close();
        info!(
            reason = self.disconnect_reason.as_deref().unwrap_or("none"),
            frames_in = self.stats.frames_in,
            bytes_in = self.stats.bytes_in,
            frames_out = self.stats.frames_out,
            bytes_out = self.stats.bytes_out,
            "session closed"
        );
    }

    /// Record a failure reason and tear down.
    pub fn fail(&mut self, reason: &str) {
        self.cancel(Some(reason));
    }

    fn allow_output(&self) -> bool {
        self.protocol.as_ref().map_or(true, |p| p.allow_output())
    }

    fn handle_frame(&mut self, now: Instant, raw: u8, body: &[u8]) -> anyhow::Result<()> {
        self.stats.frames_in += 1;

        let opcode = match Opcode::try_from(raw) {
            Ok(op) => op,
            Err(_) => {
                warn!(opcode = raw, "unknown opcode ignored");
                return Ok(());
            }
        };

        match opcode {
            Opcode::KeepConnected => {
                self.keepalive.ack_inline(now);
                Ok(())
            }
            Opcode::Ping => {
                // Peer-initiated ping; answer from the control headroom.
                if let Some(mut buf) =
                    self.pool
                        .get(ThreadCtx::Internal, None, false, true, self.transport.as_ref())
                {
                    buf.begin_frame(Opcode::KeepConnected);
                    buf.finish_frame()?;
                    self.pool
                        .put(buf, ThreadCtx::Internal, self.transport.as_ref())?;
                }
                Ok(())
            }
            Opcode::DownloadResume => {
                debug!("download resume from peer");
                self.scheduler.resume_download();
                Ok(())
            }
            other => {
                let Some(mut proto) = self.protocol.take() else {
                    return Ok(());
                };
                let mut cx = ProtoCx {
                    cfg: &self.cfg,
                    pool: self.pool.as_ref(),
                    transport: self.transport.as_ref(),
                    auth: self.auth.as_ref(),
                    scheduler: &mut self.scheduler,
                    keepalive: &mut self.keepalive,
                    privileges: &mut self.privileges,
                    now,
                };
                let result = proto.dispatch(&mut cx, other, body);
                self.protocol = Some(proto);
                result
            }
        }
    }

    fn send_ping(&mut self, seq: u32) {
        // No buffer means the ping retries on the next poll.
        let Some(mut buf) =
            self.pool
                .get(ThreadCtx::Internal, None, false, true, self.transport.as_ref())
        else {
            return;
        };
        buf.begin_frame(Opcode::Ping);
        let queued = buf
            .finish_frame()
            .and_then(|()| self.pool.put(buf, ThreadCtx::Internal, self.transport.as_ref()));
        if let Err(err) = queued {
            self.fail(&format!("ping frame: {err}"));
            return;
        }

        if self.transport.supports_oob() {
            let token = format!("{}{:04}", OOB_REQUEST_PREFIX, seq);
            if let Err(err) = self.transport.send_oob(&token) {
                self.fail(&format!("oob send: {err}"));
                return;
            }
        }
        self.keepalive.mark_ping_sent(seq);
    }

    /// Push queued frames into the transport. Each fully drained buffer is
    /// recycled for at most one immediate scheduler refill.
    fn drain_output(&mut self) {
        'frames: loop {
            let Some(mut buf) = self.pool.pop_full() else {
                break;
            };

            loop {
                match self.transport.accept_from(&mut buf) {
                    Ok(0) => {
                        // Transport saturated; retry this buffer next tick.
                        self.pool.requeue_front(buf);
                        break 'frames;
                    }
                    Ok(n) => {
                        self.stats.bytes_out += n as u64;
                        if buf.is_drained() {
                            break;
                        }
                    }
                    Err(err) => {
                        self.fail(&format!("transport write: {err}"));
                        return;
                    }
                }
            }

            self.stats.frames_out += 1;
            let finished_transfer = buf.segment().is_some_and(|s| s.is_last);
            buf.reset();

            let mut recycled = RecycledBuffContext::new();
            recycled.park(buf);
            if self.allow_output() {
                let bits = self.privileges.access_options;
                if let Err(err) = self.scheduler.step(
                    &self.pool,
                    self.transport.as_ref(),
                    self.store.as_ref(),
                    Some(&mut recycled),
                    bits,
                ) {
                    self.fail(&format!("scheduling: {err}"));
                    return;
                }
            }
            if let Some(leftover) = recycled.take() {
                self.pool.release(leftover);
            }

            if finished_transfer {
                if let Some(proto) = &mut self.protocol {
                    proto.transfer_complete();
                }
            }
        }
    }
}

/// Clone-able handle for asynchronous producers.
///
/// Pool calls through this handle are tagged external: they never block,
/// fail fast on exhaustion, and wake the internal thread after enqueueing.
#[derive(Clone)]
pub struct ExternalHandle {
    pool: Arc<BufferPool>,
    events: Arc<EventQueue>,
    transport: Arc<dyn TransportAdapter>,
}

impl ExternalHandle {
    /// Notify the session that acquisition produced new data. Returns
    /// `false` when the event queue is full and the event was dropped.
    pub fn notify_data_updated(&self, shot_name: &str, signal_ids: Vec<i32>) -> bool {
        let accepted = self.events.push(ProducerEvent::DataUpdated {
            shot_name: shot_name.to_owned(),
            signal_ids,
        });
        if accepted {
            self.transport.wake();
        } else {
            warn!(shot = shot_name, "event queue full, notification dropped");
        }
        accepted
    }

    /// Inject one broadcast frame. Returns `Ok(false)` when no buffer was
    /// available; the producer must back off, never block.
    pub fn send_frame(
        &self,
        opcode: Opcode,
        build: impl FnOnce(&mut Vec<u8>),
    ) -> anyhow::Result<bool> {
        let Some(mut buf) =
            self.pool
                .get(ThreadCtx::External, None, false, false, self.transport.as_ref())
        else {
            return Ok(false);
        };
        buf.begin_frame(opcode);
        build(buf.payload_mut());
        buf.finish_frame()?;
        self.pool
            .put(buf, ThreadCtx::External, self.transport.as_ref())?;
        Ok(true)
    }
}
