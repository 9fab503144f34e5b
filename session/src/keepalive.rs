//! Silence tracking and ping protocol.
//!
//! After one keepalive interval of inbound silence the session sends an
//! inline `Ping` frame (plus an out-of-band `"REQU" + 4-digit sequence`
//! token on transports that carry one); either the inline `KeepConnected`
//! reply or the matching `"REPL"` echo acks it. Silence beyond two
//! intervals terminates the session. The supervisor also owns the login
//! timeout and the failed-authentication grace period.

use std::time::{Duration, Instant};

use crate::config::Configuration;

/// OOB ping token prefix; the echo replaces it with [`OOB_REPLY_PREFIX`].
pub const OOB_REQUEST_PREFIX: &str = "REQU";
/// OOB ack token prefix.
pub const OOB_REPLY_PREFIX: &str = "REPL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PingState {
    Normal,
    PingSent { seq: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Pending { since: Instant },
    Authenticated,
    Failed { since: Instant },
}

/// Action the session must carry out after a keepalive poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Nothing due.
    None,
    /// Send a ping carrying this sequence number, then call
    /// [`KeepaliveSupervisor::mark_ping_sent`]. If no buffer is available
    /// the ping is retried on the next poll.
    SendPing {
        /// Sequence echoed back in the ack token
        seq: u32,
    },
    /// Terminate the session with this reason.
    Terminate(String),
}

/// Per-session silence and authentication timer state.
pub struct KeepaliveSupervisor {
    interval: Duration,
    login_timeout: Duration,
    auth_fail_grace: Duration,
    last_activity: Instant,
    ping: PingState,
    auth: AuthState,
    next_seq: u32,
}

impl KeepaliveSupervisor {
    /// Create a supervisor for a freshly accepted, unauthenticated session.
    pub fn new(cfg: &Configuration, now: Instant) -> Self {
        Self {
            interval: cfg.keepalive_interval,
            login_timeout: cfg.login_timeout,
            auth_fail_grace: cfg.auth_fail_grace,
            last_activity: now,
            ping: PingState::Normal,
            auth: AuthState::Pending { since: now },
            next_seq: 1,
        }
    }

    /// Refresh last-activity time; called on every inbound length header.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Record successful authentication.
    pub fn authenticated(&mut self) {
        self.auth = AuthState::Authenticated;
    }

    /// Record failed authentication; the session terminates after the
    /// grace period or once queued output drains, whichever first.
    pub fn auth_failed(&mut self, now: Instant) {
        if !matches!(self.auth, AuthState::Failed { .. }) {
            self.auth = AuthState::Failed { since: now };
        }
    }

    /// Whether this session has authenticated.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.auth, AuthState::Authenticated)
    }

    /// Inline `KeepConnected` ack: any outstanding ping is satisfied.
    pub fn ack_inline(&mut self, now: Instant) {
        self.ping = PingState::Normal;
        self.last_activity = now;
    }

    /// OOB ack: accepts `"REPL" + 4-digit sequence` matching the
    /// outstanding ping; anything else is ignored.
    pub fn ack_oob(&mut self, token: &str, now: Instant) {
        if let PingState::PingSent { seq } = self.ping {
            let expected = format!("{}{:04}", OOB_REPLY_PREFIX, seq);
            if token == expected {
                self.ping = PingState::Normal;
                self.last_activity = now;
            }
        }
    }

    /// Commit the state transition after the ping frame was actually
    /// queued; a failed buffer claim skips this and the poll retries.
    pub fn mark_ping_sent(&mut self, seq: u32) {
        self.ping = PingState::PingSent { seq };
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    /// Evaluate the timers. At most one action is due per poll; terminal
    /// conditions take priority over a due ping.
    pub fn poll(&mut self, now: Instant, output_drained: bool) -> KeepaliveAction {
        match self.auth {
            AuthState::Pending { since } => {
                if now.duration_since(since) > self.login_timeout {
                    return KeepaliveAction::Terminate("login timeout".into());
                }
            }
            AuthState::Failed { since } => {
                if output_drained || now.duration_since(since) > self.auth_fail_grace {
                    return KeepaliveAction::Terminate("authentication failed".into());
                }
            }
            AuthState::Authenticated => {}
        }

        let silence = now.duration_since(self.last_activity);
        match self.ping {
            PingState::Normal => {
                if silence > self.interval {
                    KeepaliveAction::SendPing { seq: self.next_seq }
                } else {
                    KeepaliveAction::None
                }
            }
            PingState::PingSent { .. } => {
                if silence > self.interval * 2 {
                    KeepaliveAction::Terminate("keepalive timeout".into())
                } else {
                    KeepaliveAction::None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Configuration {
        Configuration {
            keepalive_interval: Duration::from_secs(10),
            login_timeout: Duration::from_secs(30),
            auth_fail_grace: Duration::from_secs(5),
            ..Configuration::default()
        }
    }

    fn supervisor(now: Instant) -> KeepaliveSupervisor {
        let mut ka = KeepaliveSupervisor::new(&cfg(), now);
        ka.authenticated();
        ka
    }

    #[test]
    fn test_single_ping_after_one_interval() {
        let t0 = Instant::now();
        let mut ka = supervisor(t0);

        assert_eq!(ka.poll(t0 + Duration::from_secs(9), false), KeepaliveAction::None);

        let due = t0 + Duration::from_secs(11);
        let KeepaliveAction::SendPing { seq } = ka.poll(due, false) else {
            panic!("ping due");
        };
        ka.mark_ping_sent(seq);

        // Only one ping goes out while it stays unacked.
        assert_eq!(ka.poll(t0 + Duration::from_secs(12), false), KeepaliveAction::None);
    }

    #[test]
    fn test_termination_after_two_intervals() {
        let t0 = Instant::now();
        let mut ka = supervisor(t0);

        if let KeepaliveAction::SendPing { seq } = ka.poll(t0 + Duration::from_secs(11), false) {
            ka.mark_ping_sent(seq);
        }
        assert!(matches!(
            ka.poll(t0 + Duration::from_secs(21), false),
            KeepaliveAction::Terminate(_)
        ));
    }

    #[test]
    fn test_ack_suppresses_termination() {
        let t0 = Instant::now();
        let mut ka = supervisor(t0);

        if let KeepaliveAction::SendPing { seq } = ka.poll(t0 + Duration::from_secs(11), false) {
            ka.mark_ping_sent(seq);
        }
        ka.ack_inline(t0 + Duration::from_secs(15));

        // Timer restarts from the ack.
        assert_eq!(ka.poll(t0 + Duration::from_secs(24), false), KeepaliveAction::None);
        assert!(matches!(
            ka.poll(t0 + Duration::from_secs(26), false),
            KeepaliveAction::SendPing { .. }
        ));
    }

    #[test]
    fn test_oob_ack_matches_sequence() {
        let t0 = Instant::now();
        let mut ka = supervisor(t0);

        let KeepaliveAction::SendPing { seq } = ka.poll(t0 + Duration::from_secs(11), false)
        else {
            panic!("ping due");
        };
        ka.mark_ping_sent(seq);

        // Wrong sequence is ignored, right one acks.
        ka.ack_oob(&format!("REPL{:04}", seq + 1), t0 + Duration::from_secs(12));
        assert!(matches!(
            ka.poll(t0 + Duration::from_secs(21), false),
            KeepaliveAction::Terminate(_)
        ));

        let mut ka = supervisor(t0);
        let KeepaliveAction::SendPing { seq } = ka.poll(t0 + Duration::from_secs(11), false)
        else {
            panic!("ping due");
        };
        ka.mark_ping_sent(seq);
        ka.ack_oob(&format!("REPL{:04}", seq), t0 + Duration::from_secs(12));
        assert_eq!(ka.poll(t0 + Duration::from_secs(21), false), KeepaliveAction::None);
    }

    #[test]
    fn test_login_timeout() {
        let t0 = Instant::now();
        let mut ka = KeepaliveSupervisor::new(&cfg(), t0);

        assert_eq!(ka.poll(t0 + Duration::from_secs(29), false), KeepaliveAction::None);
        assert!(matches!(
            ka.poll(t0 + Duration::from_secs(31), false),
            KeepaliveAction::Terminate(_)
        ));
    }

    #[test]
    fn test_auth_fail_grace_or_drained() {
        let t0 = Instant::now();
        let mut ka = KeepaliveSupervisor::new(&cfg(), t0);
        ka.auth_failed(t0);

        // Pending output keeps the session alive inside the grace period.
        assert_eq!(ka.poll(t0 + Duration::from_secs(2), false), KeepaliveAction::None);

        // Drained output ends it early.
        assert!(matches!(
            ka.poll(t0 + Duration::from_secs(2), true),
            KeepaliveAction::Terminate(_)
        ));

        // Grace expiry ends it even with output still queued.
        assert!(matches!(
            ka.poll(t0 + Duration::from_secs(6), false),
            KeepaliveAction::Terminate(_)
        ));
    }
}
