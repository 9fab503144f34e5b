//! Per-session engine configuration.
//!
//! One immutable [`Configuration`] is injected at session construction;
//! nothing in the engine reads global state.

use std::time::Duration;

/// Immutable engine configuration, injected per session.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Configured outbound buffer maximum for this session type; the pool
    /// additionally allows 2 headroom slots for control frames.
    pub max_buffers: usize,
    /// Initial backing capacity of each outbound buffer.
    pub buffer_capacity: usize,
    /// Backlog byte ceiling of the flow-control gate.
    pub max_queued_bytes: u64,
    /// Backlog frame-count ceiling of the flow-control gate.
    pub max_queued_count: u32,
    /// Moderated-download threshold in bytes; `None` disables moderation.
    pub moderated_rate: Option<u64>,
    /// Whether large payloads are split into segments.
    pub segmentation: bool,
    /// Default per-tick segment ceiling, overridden by the client's
    /// advertised link speed at login.
    pub segment_ceiling: u64,
    /// Keepalive silence interval; a ping goes out after one, the session
    /// terminates after two.
    pub keepalive_interval: Duration,
    /// How long an unauthenticated session may stay connected.
    pub login_timeout: Duration,
    /// Grace period after failed authentication before forced teardown.
    pub auth_fail_grace: Duration,
    /// Total bounded wait for a free buffer on the internal thread.
    pub pool_wait_timeout: Duration,
    /// Capacity of the external-producer event queue.
    pub event_queue_depth: usize,
}

impl Configuration {
    /// Derive the per-tick segment ceiling from a client's advertised link
    /// speed. A quarter of the per-second budget keeps roughly four
    /// scheduling ticks of data in flight; the floor guards against
    /// clients advertising absurdly slow links.
    pub fn ceiling_for_link_speed(&self, kib_per_sec: u32) -> u64 {
        if kib_per_sec == 0 {
            return self.segment_ceiling;
        }
        (u64::from(kib_per_sec) * 1024 / 4).max(64 * 1024)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_buffers: 8,
            buffer_capacity: 64 * 1024,
            max_queued_bytes: 8 * 1024 * 1024,
            max_queued_count: 64,
            moderated_rate: Some(4 * 1024 * 1024),
            segmentation: true,
            segment_ceiling: 512 * 1024,
            keepalive_interval: Duration::from_secs(20),
            login_timeout: Duration::from_secs(30),
            auth_fail_grace: Duration::from_secs(5),
            pool_wait_timeout: Duration::from_secs(5),
            event_queue_depth: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_from_link_speed() {
        let cfg = Configuration::default();
        // 4 MiB/s link: one quarter second worth per tick.
        assert_eq!(cfg.ceiling_for_link_speed(4096), 1024 * 1024);
        // Unknown speed keeps the configured default.
        assert_eq!(cfg.ceiling_for_link_speed(0), cfg.segment_ceiling);
        // Floor applies for very slow links.
        assert_eq!(cfg.ceiling_for_link_speed(1), 64 * 1024);
    }
}
