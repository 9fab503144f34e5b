//! Bounded outbound buffer pool.
//!
//! Two independently locked queues feed the transport: `empty` holds free
//! buffers, `full` holds filled frames awaiting transmission. At any time a
//! buffer lives in exactly one of {empty, full, now-sending, recycled
//! context}, and the number ever allocated stays within the configured
//! maximum plus 2 headroom slots reserved for control frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::buffer::{OutgoingBuff, RecycledBuffContext};
use crate::config::Configuration;
use crate::error::EngineError;
use crate::traits::TransportAdapter;

/// Extra slots past the configured maximum, claimable with `try_harder`.
pub const POOL_HEADROOM: usize = 2;

/// Interval of one cooperative wait while blocked on a free buffer.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Which logical thread a pool call runs on. External producers never
/// block and must wake the internal thread after enqueueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCtx {
    /// The session's own decode/dispatch/scheduling thread.
    Internal,
    /// An asynchronous producer injecting into the session.
    External,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bounded free/full buffer queues feeding the transport.
pub struct BufferPool {
    empty: Mutex<Vec<OutgoingBuff>>,
    full: Mutex<VecDeque<OutgoingBuff>>,
    allocated: AtomicUsize,
    max: usize,
    buf_capacity: usize,
    wait_timeout: Duration,
}

impl BufferPool {
    /// Create a pool sized from the session configuration.
    pub fn new(cfg: &Configuration) -> Self {
        Self {
            empty: Mutex::new(Vec::with_capacity(cfg.max_buffers + POOL_HEADROOM)),
            full: Mutex::new(VecDeque::with_capacity(cfg.max_buffers + POOL_HEADROOM)),
            allocated: AtomicUsize::new(0),
            max: cfg.max_buffers,
            buf_capacity: cfg.buffer_capacity,
            wait_timeout: cfg.pool_wait_timeout,
        }
    }

    /// Obtain a free buffer.
    ///
    /// A buffer parked in `recycled` short-circuits the pool entirely.
    /// Otherwise a free buffer is popped, or a new one allocated while
    /// under the limit (`try_harder` unlocks the headroom slots). When
    /// exhausted, the internal thread with `may_block` waits cooperatively
    /// on the transport in bounded slices; external callers fail fast.
    /// `None` is a soft failure, never fatal.
    pub fn get(
        &self,
        ctx: ThreadCtx,
        recycled: Option<&mut RecycledBuffContext>,
        may_block: bool,
        try_harder: bool,
        transport: &dyn TransportAdapter,
    ) -> Option<OutgoingBuff> {
        if let Some(rc) = recycled {
            if let Some(buf) = rc.take() {
                return Some(buf);
            }
        }

        if let Some(buf) = self.try_get(try_harder) {
            return Some(buf);
        }

        if ctx == ThreadCtx::External || !may_block {
            return None;
        }

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            transport.wait_for_output_done(WAIT_SLICE);
            if let Some(buf) = self.try_get(try_harder) {
                return Some(buf);
            }
            if Instant::now() >= deadline {
                // Slow storage I/O legitimately bursts this condition.
                warn!(
                    "outbound buffer pool exhausted after {:?}; caller must back off",
                    self.wait_timeout
                );
                return None;
            }
        }
    }

    fn try_get(&self, try_harder: bool) -> Option<OutgoingBuff> {
        if let Some(buf) = lock(&self.empty).pop() {
            return Some(buf);
        }

        let limit = self.max + if try_harder { POOL_HEADROOM } else { 0 };
        let mut current = self.allocated.load(Ordering::Acquire);
        while current < limit {
            match self.allocated.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(OutgoingBuff::new(self.buf_capacity)),
                Err(actual) => current = actual,
            }
        }
        None
    }

    /// Queue a filled buffer for transmission.
    ///
    /// The declared frame length must match the bytes actually written;
    /// a mismatch is a fatal corruption error. External callers wake the
    /// internal thread so the new frame gets picked up.
    pub fn put(
        &self,
        buf: OutgoingBuff,
        ctx: ThreadCtx,
        transport: &dyn TransportAdapter,
    ) -> Result<(), EngineError> {
        buf.check_consistent()?;
        lock(&self.full).push_back(buf);
        if ctx == ThreadCtx::External {
            transport.wake();
        }
        Ok(())
    }

    /// Return an unwanted buffer: into the recycled context when one is
    /// supplied and free, otherwise back to the empty queue. Never both.
    pub fn refuse(&self, mut buf: OutgoingBuff, recycled: Option<&mut RecycledBuffContext>) {
        if let Some(rc) = recycled {
            if rc.is_empty() {
                buf.reset();
                rc.park(buf);
                return;
            }
        }
        self.release(buf);
    }

    /// Pop the oldest frame awaiting transmission.
    pub fn pop_full(&self) -> Option<OutgoingBuff> {
        lock(&self.full).pop_front()
    }

    /// Requeue a partially sent buffer at the front of the full queue.
    pub fn requeue_front(&self, buf: OutgoingBuff) {
        lock(&self.full).push_front(buf);
    }

    /// Return a drained buffer to the empty queue.
    pub fn release(&self, mut buf: OutgoingBuff) {
        buf.reset();
        lock(&self.empty).push(buf);
    }

    /// Number of frames queued for transmission.
    pub fn full_len(&self) -> usize {
        lock(&self.full).len()
    }

    /// Buffers allocated over the pool's lifetime; bounded by max + 2.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Teardown: drop every queued buffer, releasing any continuator
    /// references they hold.
    pub fn drain(&self) {
        lock(&self.full).clear();
        lock(&self.empty).clear();
    }
}
