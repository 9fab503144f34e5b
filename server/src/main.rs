//! Historian server binary.
//!
//! Accepts TCP connections and runs one session engine per connection on
//! a blocking task. The engine itself is synchronous; the socket is
//! polled with a short read timeout whose expiry doubles as the
//! scheduling tick.

use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use daqhist_session::{
    AccessControl, AppProtocol, ClientProtocol, Configuration, ReplicationProtocol, Session,
    TraceStore,
};

mod config;
mod replication;
mod store;
mod transport;

use config::ServerConfig;
use replication::ReplicationSink;
use store::{DirStore, OpenAccess};
use transport::TcpTransport;

/// Data-acquisition historian server
#[derive(Parser, Debug)]
#[command(name = "daqhist-server", version, about = "Data-acquisition historian server")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:7654 (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(long, default_value = "daqhist.yaml")]
    config: PathBuf,

    /// Trace store root directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Session variant: client, replication
    #[arg(long, default_value = "client")]
    mode: String,

    /// Keepalive silence interval, e.g. 20s (overrides the config file)
    #[arg(long)]
    keepalive_interval: Option<humantime::Duration>,

    /// Socket poll / scheduling tick interval, e.g. 100ms
    #[arg(long, default_value = "100ms")]
    tick_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug)]
enum Mode {
    Client,
    Replication,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("daqhist_server={}", args.log_level).parse()?)
        .add_directive(format!("daqhist_session={}", args.log_level).parse()?)
        .add_directive(format!("daqhist_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!("Starting daqhist server v{}", env!("CARGO_PKG_VERSION"));

    let server_config = ServerConfig::load_from_file(&args.config)?;

    let listen: SocketAddr = match args.listen {
        Some(addr) => addr,
        None => server_config.listen.parse()?,
    };
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&server_config.data_dir));

    let mode = match args.mode.as_str() {
        "client" => Mode::Client,
        "replication" => Mode::Replication,
        other => anyhow::bail!("invalid mode: {other}. Use 'client' or 'replication'"),
    };

    let mut engine_cfg = server_config.engine_config();
    if let Some(interval) = args.keepalive_interval {
        engine_cfg.keepalive_interval = interval.into();
    }
    let tick = Duration::from(args.tick_interval);

    info!(
        "Session config: mode={mode:?}, max_buffers={}, segment_ceiling={}, moderated_rate={:?}, keepalive={:?}",
        engine_cfg.max_buffers,
        engine_cfg.segment_ceiling,
        engine_cfg.moderated_rate,
        engine_cfg.keepalive_interval
    );

    let store: Arc<dyn TraceStore> = Arc::new(DirStore::new(data_dir.clone()));
    let auth: Arc<dyn AccessControl> = Arc::new(OpenAccess);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("Listening on {listen}, trace store at {data_dir:?}");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("Accept error: {err}; stopping listener");
                break;
            }
        };
        info!("Accepted connection from {peer_addr}");

        let engine_cfg = engine_cfg.clone();
        let store = Arc::clone(&store);
        let auth = Arc::clone(&auth);
        let data_dir = data_dir.clone();

        tokio::task::spawn_blocking(move || {
            let protocol: Box<dyn AppProtocol> = match mode {
                Mode::Client => Box::new(ClientProtocol),
                Mode::Replication => Box::new(ReplicationProtocol::new(Arc::new(
                    ReplicationSink::new(data_dir),
                ))),
            };
            match stream.into_std() {
                Ok(std_stream) => {
                    if let Err(err) =
                        run_session(std_stream, engine_cfg, store, auth, protocol, tick)
                    {
                        warn!("Session error from {peer_addr}: {err:#}");
                    }
                }
                Err(err) => warn!("Failed to detach stream from {peer_addr}: {err}"),
            }
        });
    }

    Ok(())
}

/// Drive one session to completion on the current (blocking) thread.
///
/// The read timeout is the tick cadence: every expiry runs keepalive,
/// scheduling, and output draining even when the peer is silent.
fn run_session(
    stream: std::net::TcpStream,
    engine_cfg: Configuration,
    store: Arc<dyn TraceStore>,
    auth: Arc<dyn AccessControl>,
    protocol: Box<dyn AppProtocol>,
    tick: Duration,
) -> anyhow::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(tick))?;
    stream.set_nodelay(true)?;

    let write_half = stream.try_clone()?;
    let transport = Arc::new(TcpTransport::new(write_half));
    let mut session = Session::new(engine_cfg, transport, store, auth, protocol, Instant::now());

    let mut stream = stream;
    let mut read_buf = vec![0u8; 16 * 1024];

    while !session.is_cancelled() {
        match stream.read(&mut read_buf) {
            Ok(0) => session.fail("connection closed by peer"),
            Ok(n) => {
                // A framing error already cancelled the session and will
                // surface through the disconnect reason below.
                let _ = session.feed(&read_buf[..n], Instant::now());
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(err) => session.fail(&format!("read: {err}")),
        }
        session.tick(Instant::now());
    }

    if let Some(reason) = session.disconnect_reason() {
        info!("Session ended: {reason}");
    }
    Ok(())
}
