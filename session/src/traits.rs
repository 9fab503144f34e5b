//! Collaborator contracts.
//!
//! The engine never performs socket I/O, credential lookup, or storage
//! access itself; it talks to those subsystems through the traits defined
//! here. Transport adapters, stores, and authenticators are injected at
//! session construction.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::OutgoingBuff;
use crate::error::{AuthError, StoreError};

/// Contract implemented by a transport adapter (raw TCP, WebSocket, …).
///
/// `accept_from` pulls header bytes and then continuator-streamed bytes out
/// of an outbound buffer into the transport's own send path;
/// `wait_for_output_done` is the engine's only blocking primitive, bounded
/// by the caller's timeout.
pub trait TransportAdapter: Send + Sync {
    /// Whether the underlying connection is still open.
    fn is_open(&self) -> bool;

    /// Close the underlying connection. Idempotent.
    fn close(&self);

    /// Whether the transport carries an out-of-band side channel.
    fn supports_oob(&self) -> bool {
        false
    }

    /// Send a short ASCII token on the out-of-band channel.
    fn send_oob(&self, token: &str) -> io::Result<()>;

    /// Pull bytes from an outbound buffer into the send path, returning the
    /// number consumed. `Ok(0)` means the transport cannot take more right
    /// now; the engine re-queues the buffer and retries next tick.
    fn accept_from(&self, buf: &mut OutgoingBuff) -> io::Result<usize>;

    /// Cooperatively wait until some queued output has drained or the
    /// timeout elapses. Returns `true` when progress was made.
    fn wait_for_output_done(&self, timeout: Duration) -> bool;

    /// Wake the session's internal thread; called by external producers
    /// after they enqueue work.
    fn wake(&self);
}

/// Streaming handle to a large external data source (the Continuator).
///
/// Shared across in-flight segments via `Arc`; the use count is the Arc
/// strong count, and the source is released when the last referencing
/// buffer drains.
pub trait TraceSource: Send + Sync {
    /// Total size of the source in bytes.
    fn len(&self) -> u64;

    /// Whether the source is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access option bits reported to the client.
    fn access_options(&self) -> i32;

    /// Read bytes at an absolute offset; short reads are allowed.
    fn read_at(&self, offset: u64, out: &mut [u8]) -> io::Result<usize>;
}

/// Result of resolving a trace request against the store.
pub enum TraceData {
    /// Data is available for streaming.
    Ready(Arc<dyn TraceSource>),
    /// Acquisition has not produced this trace yet; the request parks in
    /// the paused queue until a data-updated notification arrives.
    NotReady,
}

/// Trace/signal storage engine collaborator.
pub trait TraceStore: Send + Sync {
    /// Resolve a `(shot, signal id)` identity to a streaming source.
    fn open_trace(&self, shot: &str, id: i32) -> Result<TraceData, StoreError>;
}

/// Privileges granted by a successful login.
#[derive(Debug, Clone, Copy, Default)]
pub struct Privileges {
    /// Access option bits merged into replies for this session.
    pub access_options: i32,
}

/// Authentication/permission collaborator.
pub trait AccessControl: Send + Sync {
    /// Validate credentials, returning session privileges.
    fn login(&self, user: &str, password: &str) -> Result<Privileges, AuthError>;
}

/// Replication business-logic collaborator; the engine only owns the
/// envelope (framing, JSON split, file-part headers).
pub trait ReplicationHandler: Send + Sync {
    /// Process one JSON document, optionally with a binary attachment,
    /// returning the reply document.
    fn on_document(
        &self,
        doc: serde_json::Value,
        attachment: Option<&[u8]>,
    ) -> anyhow::Result<serde_json::Value>;

    /// Process one inbound replication file part.
    fn on_file_part(&self, header: daqhist_wire::FilePartHeader, data: &[u8])
        -> anyhow::Result<()>;
}
