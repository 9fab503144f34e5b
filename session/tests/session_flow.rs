//! End-to-end flows through the session engine with in-memory
//! collaborators: login, trace download, segmentation, moderation, and
//! data-updated wakeups.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use daqhist_session::{
    AccessControl, AuthError, ClientProtocol, Configuration, OutgoingBuff, Privileges, Session,
    StoreError, TraceData, TraceSource, TraceStore, TransportAdapter,
};
use daqhist_wire::{
    begin_header, finish_header, LoginMsg, Opcode, TraceReplyHeader, TraceRequestMsg, MAGIC,
};

struct MemTransport {
    out: Mutex<Vec<u8>>,
    open: AtomicBool,
}

impl MemTransport {
    fn new() -> Self {
        Self {
            out: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }

    fn captured(&self) -> Vec<u8> {
        self.out.lock().unwrap().clone()
    }
}

impl TransportAdapter for MemTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
    fn send_oob(&self, _token: &str) -> io::Result<()> {
        Ok(())
    }
    fn accept_from(&self, buf: &mut OutgoingBuff) -> io::Result<usize> {
        let mut tmp = [0u8; 8192];
        let n = buf.read_into(&mut tmp)?;
        self.out.lock().unwrap().extend_from_slice(&tmp[..n]);
        Ok(n)
    }
    fn wait_for_output_done(&self, _timeout: Duration) -> bool {
        true
    }
    fn wake(&self) {}
}

struct MemSource(Vec<u8>);

impl TraceSource for MemSource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }
    fn access_options(&self) -> i32 {
        0
    }
    fn read_at(&self, offset: u64, out: &mut [u8]) -> io::Result<usize> {
        let start = offset as usize;
        let take = (self.0.len() - start).min(out.len());
        out[..take].copy_from_slice(&self.0[start..start + take]);
        Ok(take)
    }
}

/// Store whose contents can be populated while a session is running.
struct MemStore {
    traces: Mutex<HashMap<(String, i32), Vec<u8>>>,
}

impl MemStore {
    fn new() -> Self {
        Self {
            traces: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, shot: &str, id: i32, data: Vec<u8>) {
        self.traces
            .lock()
            .unwrap()
            .insert((shot.to_owned(), id), data);
    }
}

impl TraceStore for MemStore {
    fn open_trace(&self, shot: &str, id: i32) -> Result<TraceData, StoreError> {
        match self.traces.lock().unwrap().get(&(shot.to_owned(), id)) {
            Some(data) => Ok(TraceData::Ready(Arc::new(MemSource(data.clone())))),
            None => Ok(TraceData::NotReady),
        }
    }
}

struct AllowAll;

impl AccessControl for AllowAll {
    fn login(&self, _user: &str, _password: &str) -> Result<Privileges, AuthError> {
        Ok(Privileges::default())
    }
}

fn make_frame(opcode: Opcode, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let start = begin_header(&mut buf, opcode);
    buf.extend_from_slice(body);
    finish_header(&mut buf, start, body.len() as u32);
    buf
}

fn parse_frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        assert!(bytes.len() >= 8, "truncated frame header");
        let opcode = bytes[0];
        assert_eq!(&bytes[1..4], &MAGIC);
        let len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert!(bytes.len() >= 8 + len, "truncated frame body");
        frames.push((opcode, bytes[8..8 + len].to_vec()));
        bytes = &bytes[8 + len..];
    }
    frames
}

struct Harness {
    transport: Arc<MemTransport>,
    store: Arc<MemStore>,
    session: Session,
    now: Instant,
}

impl Harness {
    fn new(cfg: Configuration) -> Self {
        let transport = Arc::new(MemTransport::new());
        let store = Arc::new(MemStore::new());
        let now = Instant::now();
        let session = Session::new(
            cfg,
            Arc::clone(&transport) as Arc<dyn TransportAdapter>,
            Arc::clone(&store) as Arc<dyn TraceStore>,
            Arc::new(AllowAll),
            Box::new(ClientProtocol),
            now,
        );
        Self {
            transport,
            store,
            session,
            now,
        }
    }

    fn login(&mut self) {
        let mut body = Vec::new();
        LoginMsg {
            user: "operator".into(),
            password: "pw".into(),
            link_speed_kib: 0,
        }
        .encode(&mut body)
        .unwrap();
        self.session
            .feed(&make_frame(Opcode::Login, &body), self.now)
            .unwrap();
        self.session.tick(self.now);
        // Discard the login reply so tests see only what follows.
        self.transport.out.lock().unwrap().clear();
    }

    fn request_trace(&mut self, shot: &str, ids: Vec<i32>) {
        let mut body = Vec::new();
        TraceRequestMsg {
            shot_name: shot.into(),
            ids,
        }
        .encode(&mut body)
        .unwrap();
        self.session
            .feed(&make_frame(Opcode::TraceCall, &body), self.now)
            .unwrap();
    }

    fn frames(&self) -> Vec<(u8, Vec<u8>)> {
        parse_frames(&self.transport.captured())
    }
}

#[test]
fn test_trace_call_yields_trace_come_with_full_payload() {
    let mut h = Harness::new(Configuration::default());
    h.store.insert("ABCD0001", 5, (0..10u8).collect());
    h.login();

    h.request_trace("ABCD0001", vec![5]);
    h.session.tick(h.now);

    let frames = h.frames();
    assert_eq!(frames.len(), 1);
    let (opcode, body) = &frames[0];
    assert_eq!(*opcode, Opcode::TraceCome as u8);

    let (header, payload) = TraceReplyHeader::decode(body, false).unwrap();
    assert_eq!(header.shot_name, "ABCD0001");
    assert_eq!(header.signal_id, 5);
    assert!(header.segment.is_none());
    assert_eq!(payload.len(), 10);
    assert_eq!(payload, (0..10u8).collect::<Vec<_>>().as_slice());
}

#[test]
fn test_segmented_download_reassembles() {
    let cfg = Configuration {
        max_buffers: 16,
        segment_ceiling: 100,
        moderated_rate: None,
        ..Configuration::default()
    };
    let mut h = Harness::new(cfg);
    let data: Vec<u8> = (0..=255u8).cycle().take(950).collect();
    h.store.insert("SHOT7", 3, data.clone());
    h.login();

    h.request_trace("SHOT7", vec![3]);
    for _ in 0..32 {
        h.session.tick(h.now);
    }

    let frames = h.frames();
    assert!(frames.len() > 1, "payload should be segmented");

    let mut assembled = vec![0u8; data.len()];
    let mut last_seen = 0;
    for (opcode, body) in &frames {
        assert_eq!(*opcode, Opcode::TraceCome as u8);
        let (header, chunk) = TraceReplyHeader::decode(body, true).unwrap();
        let seg = header.segment.unwrap();
        assert_eq!(seg.full_size, data.len() as i64);
        assert!(chunk.len() as u64 <= 100);
        let off = seg.offset as usize;
        assembled[off..off + chunk.len()].copy_from_slice(chunk);
        if off + chunk.len() == data.len() {
            last_seen += 1;
        }
    }
    assert_eq!(assembled, data);
    assert_eq!(last_seen, 1);
}

#[test]
fn test_moderation_pause_and_resume() {
    let cfg = Configuration {
        segment_ceiling: 100,
        moderated_rate: Some(250),
        ..Configuration::default()
    };
    let mut h = Harness::new(cfg);
    let data = vec![0x55u8; 1000];
    h.store.insert("SHOT7", 3, data.clone());
    h.login();

    h.request_trace("SHOT7", vec![3]);
    for _ in 0..32 {
        h.session.tick(h.now);
    }

    let frames = h.frames();
    let pauses = frames
        .iter()
        .filter(|(op, _)| *op == Opcode::DownloadPause as u8)
        .count();
    assert_eq!(pauses, 1);
    let sent: usize = frames
        .iter()
        .filter(|(op, _)| *op == Opcode::TraceCome as u8)
        .map(|(_, b)| TraceReplyHeader::decode(b, true).unwrap().1.len())
        .sum();
    assert!(sent < data.len(), "gate must hold back the tail");

    // Client acknowledges with an explicit resume; the rest flows.
    h.session
        .feed(&make_frame(Opcode::DownloadResume, b""), h.now)
        .unwrap();
    for _ in 0..32 {
        h.session.tick(h.now);
        // Each resume releases one more moderated window.
        h.session
            .feed(&make_frame(Opcode::DownloadResume, b""), h.now)
            .unwrap();
    }

    let sent: usize = h
        .frames()
        .iter()
        .filter(|(op, _)| *op == Opcode::TraceCome as u8)
        .map(|(_, b)| TraceReplyHeader::decode(b, true).unwrap().1.len())
        .sum();
    assert_eq!(sent, data.len());
}

#[test]
fn test_data_updated_wakes_paused_request() {
    let mut h = Harness::new(Configuration::default());
    h.login();

    // Not in the store yet: the request parks.
    h.request_trace("ABCD0001", vec![5]);
    h.session.tick(h.now);
    assert!(h.frames().is_empty());

    // Acquisition finishes and an external producer notifies the session.
    h.store.insert("ABCD0001", 5, vec![9u8; 16]);
    let handle = h.session.external_handle();
    assert!(handle.notify_data_updated("ABCD0001", vec![5]));
    h.session.tick(h.now);

    let frames = h.frames();
    assert_eq!(frames.len(), 1);
    let (header, payload) = TraceReplyHeader::decode(&frames[0].1, false).unwrap();
    assert_eq!(header.signal_id, 5);
    assert_eq!(payload.len(), 16);
}

#[test]
fn test_refuse_cancels_queued_request() {
    let mut h = Harness::new(Configuration::default());
    h.store.insert("ABCD0001", 5, vec![1u8; 8]);
    h.login();

    h.request_trace("ABCD0001", vec![5]);
    let mut body = Vec::new();
    TraceRequestMsg {
        shot_name: "ABCD0001".into(),
        ids: vec![5],
    }
    .encode(&mut body)
    .unwrap();
    h.session
        .feed(&make_frame(Opcode::RefuseTrace, &body), h.now)
        .unwrap();
    h.session.tick(h.now);

    assert!(h.frames().is_empty());
}
