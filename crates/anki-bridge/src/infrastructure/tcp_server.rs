//! TCP server: accept loop and per-session read loop.
//!
//! This module is responsible for:
//!
//! 1. Binding the TCP listener the SDK connects to.
//! 2. Building the shared [`BridgeState`], [`DiscoveryEngine`] and
//!    [`CommandDispatcher`] once for the whole process.
//! 3. Running one read loop per accepted connection.  Every read is split
//!    into newline-terminated frames and each frame is dispatched on its own
//!    task, so a 5-second SCAN never delays a raw speed command.
//! 4. Tearing down every connected vehicle when a session ends and when the
//!    `running` flag is cleared.
//!
//! # Session teardown
//!
//! A read error and a clean EOF are handled the same way: the peer is gone,
//! so every connected vehicle is disconnected and the connection registries
//! are cleared.  Device state is process-wide, so this affects vehicles
//! connected through other sessions too.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use anki_core::protocol::split_frames;

use crate::application::{
    BridgeState, CommandDispatcher, DiscoveryEngine, FrameSink, Transport,
};
use crate::domain::config::BridgeConfig;
use crate::infrastructure::session_writer::SessionWriter;

/// Size of the per-session read buffer.  The SDK pads frames to at most this.
pub const READ_BUFFER_SIZE: usize = 1024;

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `config.listen_addr` and serves until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server<T: Transport>(
    config: BridgeConfig,
    transport: Arc<T>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind TCP listener on {}", config.listen_addr))?;

    info!("bridge listening on {}", config.listen_addr);

    serve(listener, config, transport, running).await
}

/// Runs the accept loop on an already bound listener.
///
/// Split from [`run_server`] so tests can bind port 0 and learn the address
/// before serving.
///
/// # Errors
///
/// Currently infallible once the listener exists; accept errors are logged
/// and the loop continues.
pub async fn serve<T: Transport>(
    listener: TcpListener,
    config: BridgeConfig,
    transport: Arc<T>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::clone(&transport),
        Arc::new(BridgeState::new()),
        Arc::new(DiscoveryEngine::new(transport)),
        Arc::clone(&config),
    ));

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                info!("new SDK connection from {peer_addr}");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {peer_addr}: {e}");
                }
                let dispatcher = Arc::clone(&dispatcher);
                let write_timeout = config.write_timeout;
                tokio::spawn(async move {
                    handle_session(stream, peer_addr, dispatcher, write_timeout).await;
                });
            }
            Ok(Err(e)) => {
                error!("accept error: {e}");
            }
            Err(_) => {
                // No connection within the poll interval.
            }
        }
    }

    dispatcher.disconnect_all().await;
    Ok(())
}

// ── Per-session handler ───────────────────────────────────────────────────────

/// Runs one session and logs how it ended.
async fn handle_session<S, T>(
    stream: S,
    peer_addr: SocketAddr,
    dispatcher: Arc<CommandDispatcher<T>>,
    write_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    T: Transport,
{
    match run_session(stream, &peer_addr.to_string(), dispatcher, write_timeout).await {
        Ok(()) => info!("session {peer_addr} closed by peer"),
        Err(e) => warn!("session {peer_addr} closed with error: {e:#}"),
    }
}

/// Reads frames from `stream` until EOF or a read error, dispatching each on
/// its own task, then disconnects every vehicle.
///
/// # Errors
///
/// Returns the read error that ended the session.  Teardown has already run
/// when this returns.
pub async fn run_session<S, T>(
    stream: S,
    peer: &str,
    dispatcher: Arc<CommandDispatcher<T>>,
    write_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    T: Transport,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(SessionWriter::new(writer, write_timeout));
    let sink: Arc<dyn FrameSink> = Arc::clone(&writer) as Arc<dyn FrameSink>;

    let mut buf = [0u8; READ_BUFFER_SIZE];
    let outcome = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                let epoch = dispatcher.state().teardown_epoch();
                for frame in split_frames(&buf[..n]) {
                    let frame = frame.to_vec();
                    let dispatcher = Arc::clone(&dispatcher);
                    let sink = Arc::clone(&sink);
                    tokio::spawn(async move {
                        dispatcher.dispatch_since(&frame, sink, epoch).await;
                    });
                }
            }
            Err(e) => {
                break Err(anyhow::Error::new(e).context(format!("read from {peer} failed")));
            }
        }
    };

    info!("session {peer} ended; disconnecting all vehicles");
    dispatcher.disconnect_all().await;
    writer.shutdown().await;
    outcome
}

// ── Tests ─────────────────────────────────────────────────────────────────────
