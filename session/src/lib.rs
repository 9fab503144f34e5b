//! Transport-independent session engine of the historian server.
//!
//! Each accepted connection gets one [`Session`], which composes:
//!
//! - a frame decoder (from `daqhist-wire`) turning raw bytes into frames,
//! - a bounded [`BufferPool`] of reusable outbound buffers,
//! - a [`TraceScheduler`] emitting flow-controlled, segmented trace
//!   downloads,
//! - a [`KeepaliveSupervisor`] owning silence and authentication timers,
//! - a pluggable [`AppProtocol`] strategy for the session variant.
//!
//! The engine performs no socket I/O itself. A transport adapter feeds it
//! inbound bytes ([`Session::feed`]), drives it periodically
//! ([`Session::tick`]), and pulls outbound bytes through
//! [`TransportAdapter::accept_from`]. Storage, authentication, and
//! replication business logic are injected behind the traits in
//! [`traits`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod keepalive;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod trace;
pub mod traits;

pub use buffer::{OutgoingBuff, RecycledBuffContext, Segment};
pub use config::Configuration;
pub use error::{AuthError, EngineError, StoreError};
pub use events::{EventQueue, ProducerEvent};
pub use keepalive::{KeepaliveAction, KeepaliveSupervisor};
pub use pool::{BufferPool, ThreadCtx, POOL_HEADROOM};
pub use protocol::{AppProtocol, ClientProtocol, ProtoCx, ReplicationProtocol};
pub use session::{ExternalHandle, Session, SessionStats};
pub use trace::{TraceRequest, TraceScheduler};
pub use traits::{
    AccessControl, Privileges, ReplicationHandler, TraceData, TraceSource, TraceStore,
    TransportAdapter,
};
