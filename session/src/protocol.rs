//! Application protocol strategies.
//!
//! One engine serves every session variant; the variants differ only in
//! how application opcodes are dispatched. [`ClientProtocol`] handles
//! plain historian clients (login, trace download), while
//! [`ReplicationProtocol`] handles the server-to-server replication
//! envelope (JSON documents, file parts). Control opcodes (`Ping`,
//! `KeepConnected`, `DownloadResume`) never reach a strategy; the session
//! handles them itself.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::{debug, warn};

use daqhist_wire::{
    decode_json_with_attachment, FilePartHeader, LoginMsg, LoginReplyMsg, Opcode, TraceRequestMsg,
};

use crate::config::Configuration;
use crate::keepalive::KeepaliveSupervisor;
use crate::pool::{BufferPool, ThreadCtx};
use crate::trace::TraceScheduler;
use crate::traits::{AccessControl, Privileges, ReplicationHandler, TransportAdapter};

/// Borrowed view of the session's mutable parts, handed to a strategy for
/// the duration of one dispatch call.
pub struct ProtoCx<'a> {
    /// Engine configuration
    pub cfg: &'a Configuration,
    /// Outbound buffer pool
    pub pool: &'a BufferPool,
    /// Transport adapter
    pub transport: &'a dyn TransportAdapter,
    /// Authentication collaborator
    pub auth: &'a dyn AccessControl,
    /// Trace scheduler
    pub scheduler: &'a mut TraceScheduler,
    /// Keepalive and auth-state timers
    pub keepalive: &'a mut KeepaliveSupervisor,
    /// Privileges granted at login
    pub privileges: &'a mut Privileges,
    /// Dispatch timestamp
    pub now: Instant,
}

impl ProtoCx<'_> {
    /// Queue a small reply frame built by `build`. Control replies use the
    /// pool headroom so a saturated data path cannot starve them. Returns
    /// `false` when even the headroom is exhausted.
    pub fn send_reply(
        &mut self,
        opcode: Opcode,
        build: impl FnOnce(&mut Vec<u8>) -> Result<(), daqhist_wire::WireError>,
    ) -> anyhow::Result<bool> {
        let Some(mut buf) = self
            .pool
            .get(ThreadCtx::Internal, None, false, true, self.transport)
        else {
            warn!(?opcode, "no buffer for reply frame");
            return Ok(false);
        };
        buf.begin_frame(opcode);
        build(buf.payload_mut())?;
        buf.finish_frame()?;
        self.pool.put(buf, ThreadCtx::Internal, self.transport)?;
        Ok(true)
    }
}

/// Per-variant opcode dispatch.
///
/// Errors returned from `dispatch` are fatal to the session; strategies
/// report application-level failures inside reply frames instead.
pub trait AppProtocol: Send {
    /// Handle one application frame.
    fn dispatch(&mut self, cx: &mut ProtoCx<'_>, opcode: Opcode, body: &[u8])
        -> anyhow::Result<()>;

    /// Extra flow gate consulted before each scheduling step.
    fn allow_output(&self) -> bool {
        true
    }

    /// Called after the final buffer of a transfer fully drains.
    fn transfer_complete(&mut self) {}
}

/// Shared login handling. Authentication failures are application-level:
/// the client gets a nonzero result code and the keepalive supervisor
/// starts the teardown grace period.
fn handle_login(cx: &mut ProtoCx<'_>, body: &[u8]) -> anyhow::Result<()> {
    let msg = LoginMsg::decode(body).context("login payload")?;
    let reply = match cx.auth.login(&msg.user, &msg.password) {
        Ok(granted) => {
            *cx.privileges = granted;
            cx.keepalive.authenticated();
            cx.scheduler
                .set_ceiling(cx.cfg.ceiling_for_link_speed(msg.link_speed_kib));
            debug!(user = %msg.user, link_speed_kib = msg.link_speed_kib, "login ok");
            LoginReplyMsg {
                result: 0,
                message: String::new(),
            }
        }
        Err(err) => {
            warn!(user = %msg.user, %err, "login rejected");
            cx.keepalive.auth_failed(cx.now);
            LoginReplyMsg {
                result: 1,
                message: err.to_string(),
            }
        }
    };
    cx.send_reply(Opcode::LoginReply, |payload| reply.encode(payload))?;
    Ok(())
}

/// Plain historian client: login plus trace download.
#[derive(Default)]
pub struct ClientProtocol;

impl AppProtocol for ClientProtocol {
    fn dispatch(
        &mut self,
        cx: &mut ProtoCx<'_>,
        opcode: Opcode,
        body: &[u8],
    ) -> anyhow::Result<()> {
        match opcode {
            Opcode::Login => handle_login(cx, body),
            Opcode::TraceCall => {
                if !cx.keepalive.is_authenticated() {
                    warn!("trace request before login ignored");
                    return Ok(());
                }
                let msg = TraceRequestMsg::decode(body).context("trace request payload")?;
                for id in msg.ids {
                    cx.scheduler.request(&msg.shot_name, id);
                }
                Ok(())
            }
            Opcode::RefuseTrace => {
                let msg = TraceRequestMsg::decode(body).context("refuse payload")?;
                for id in msg.ids {
                    cx.scheduler.refuse(&msg.shot_name, id);
                }
                Ok(())
            }
            other => {
                warn!(opcode = ?other, "opcode not handled by client protocol");
                Ok(())
            }
        }
    }
}

/// Replication peer: JSON documents with optional binary attachments plus
/// inbound file parts. Business logic lives behind the injected
/// [`ReplicationHandler`]; this strategy owns only the envelope.
pub struct ReplicationProtocol {
    handler: Arc<dyn ReplicationHandler>,
}

impl ReplicationProtocol {
    /// Create a replication strategy around the given handler.
    pub fn new(handler: Arc<dyn ReplicationHandler>) -> Self {
        Self { handler }
    }

    fn handle_document(
        &mut self,
        cx: &mut ProtoCx<'_>,
        json: &[u8],
        attachment: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        let doc: serde_json::Value =
            serde_json::from_slice(json).context("replication document")?;
        match self.handler.on_document(doc, attachment) {
            Ok(reply) => {
                let bytes = serde_json::to_vec(&reply).context("reply document")?;
                cx.send_reply(Opcode::Json, |payload| {
                    payload.extend_from_slice(&bytes);
                    Ok(())
                })?;
            }
            Err(err) => {
                // Application-level: report inside the reply document.
                warn!(%err, "replication document rejected");
                let reply = serde_json::json!({ "error": err.to_string() });
                let bytes = serde_json::to_vec(&reply).context("error document")?;
                cx.send_reply(Opcode::Json, |payload| {
                    payload.extend_from_slice(&bytes);
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}

impl AppProtocol for ReplicationProtocol {
    fn dispatch(
        &mut self,
        cx: &mut ProtoCx<'_>,
        opcode: Opcode,
        body: &[u8],
    ) -> anyhow::Result<()> {
        match opcode {
            Opcode::Login => handle_login(cx, body),
            Opcode::Json => self.handle_document(cx, body, None),
            Opcode::JsonWithAttachment => {
                let (json, attachment) =
                    decode_json_with_attachment(body).context("attachment envelope")?;
                let json = json.to_vec();
                self.handle_document(cx, &json, Some(attachment))
            }
            Opcode::FilePart => {
                let (header, data) = FilePartHeader::decode(body).context("file part header")?;
                if let Err(err) = self.handler.on_file_part(header, data) {
                    warn!(%err, "file part rejected");
                }
                Ok(())
            }
            other => {
                warn!(opcode = ?other, "opcode not handled by replication protocol");
                Ok(())
            }
        }
    }
}
