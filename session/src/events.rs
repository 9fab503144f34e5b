//! External-producer event queue.
//!
//! Asynchronous producers (acquisition control, broadcast fan-out) never
//! touch the session's queues directly. They push events here under a
//! dedicated lock; the internal thread drains the queue once per tick.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Event injected into a session by an external producer.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    /// Acquisition produced new data for the named shot; paused trace
    /// requests matching one of the ids move back to pending.
    DataUpdated {
        /// Shot name
        shot_name: String,
        /// Updated signal ids (option bits in the high byte are ignored
        /// when matching)
        signal_ids: Vec<i32>,
    },
}

/// Small bounded circular event queue, drained once per scheduling tick.
pub struct EventQueue {
    inner: Mutex<VecDeque<ProducerEvent>>,
    depth: usize,
}

impl EventQueue {
    /// Create a queue holding at most `depth` undelivered events.
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(depth)),
            depth,
        }
    }

    /// Enqueue an event; `false` when the queue is full (the producer must
    /// drop or retry, never block the session).
    pub fn push(&self, event: ProducerEvent) -> bool {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if q.len() >= self.depth {
            return false;
        }
        q.push_back(event);
        true
    }

    /// Take every queued event, oldest first.
    pub fn drain(&self) -> Vec<ProducerEvent> {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        q.drain(..).collect()
    }
}
