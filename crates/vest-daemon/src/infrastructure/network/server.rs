//! TCP control server: accept loop and per-session tasks.
//!
//! Each client connection gets two tasks:
//!
//! ```text
//!            ┌───────────── session task ─────────────┐
//!  socket ──►│ LineReader ─► parse ─► router.handle() │──► send_to(id)
//!            └────────────────────────────────────────┘        │
//!                                                              ▼
//!  socket ◄── writer task ◄── outbound queue ◄── broadcast(event)
//! ```
//!
//! Requests from one client are handled one at a time, so its responses come
//! back in request order.  Different clients are handled concurrently.
//!
//! A malformed line (bad JSON, not an object, invalid UTF-8, too long) is
//! logged and dropped; the session keeps going.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::framing::{Frame, LineReader};
use super::session_manager::{OutboundLine, SessionManager};
use crate::application::command_router::{CommandRouter, EventSink};
use crate::domain::{parse_request, Event, EventPayload};

/// Per-session limits.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Longest accepted request line, in bytes.
    pub max_line_bytes: usize,
    /// Upper bound on writing one outbound line to a client socket.
    pub write_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_line_bytes: 64 * 1024,
            write_timeout: Duration::from_secs(2),
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Runs the accept loop until `running` is cleared.
///
/// The listener is already bound, so bind errors surface to the caller
/// before anything is spawned.
pub async fn serve(
    listener: TcpListener,
    router: Arc<CommandRouter>,
    sessions: Arc<SessionManager>,
    settings: ServerSettings,
    running: Arc<AtomicBool>,
) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the running flag is rechecked while idle.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                let router = Arc::clone(&router);
                let sessions = Arc::clone(&sessions);
                tokio::spawn(async move {
                    handle_session(stream, peer_addr, router, sessions, settings).await;
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }
}

// ── Per-session handler ───────────────────────────────────────────────────────

async fn handle_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<CommandRouter>,
    sessions: Arc<SessionManager>,
    settings: ServerSettings,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set TCP_NODELAY for {peer_addr}: {e}");
    }

    let (id, outbound) = sessions.register();
    info!("session {id}: client connected from {peer_addr}");
    sessions.publish(Event::new(EventPayload::ClientConnected {
        client_id: id.clone(),
    }));

    let (read_half, write_half) = stream.into_split();
    let mut writer = tokio::spawn(write_loop(
        id.clone(),
        write_half,
        outbound,
        settings.write_timeout,
    ));
    let mut writer_done = false;
    let mut reader = LineReader::new(read_half, settings.max_line_bytes);

    loop {
        let frame = tokio::select! {
            frame = reader.next_frame() => frame,
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                debug!("session {id}: writer stopped");
                break;
            }
        };

        let line = match frame {
            Ok(Some(Frame::Line(line))) => line,
            Ok(Some(Frame::Malformed(e))) => {
                warn!("session {id}: dropping malformed line: {e}");
                continue;
            }
            Ok(None) => break,
            Err(e) => {
                debug!("session {id}: read error: {e}");
                break;
            }
        };

        let request = match parse_request(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("session {id}: dropping malformed line: {e}");
                continue;
            }
        };

        // Awaited outside the select so a dispatch is never cancelled halfway.
        let response = router.handle(request).await;
        if !sessions.send_to(&id, response.to_line()) {
            break;
        }
    }

    sessions.unregister(&id);
    sessions.publish(Event::new(EventPayload::ClientDisconnected {
        client_id: id.clone(),
    }));
    if !writer_done {
        // Unregistering closed the queue; let the writer flush what is left.
        let _ = timeout(settings.write_timeout, writer).await;
    }
    info!("session {id}: client disconnected");
}

async fn write_loop(
    id: String,
    mut socket: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<OutboundLine>,
    write_timeout: Duration,
) {
    let mut buf = Vec::new();
    while let Some(line) = outbound.recv().await {
        buf.clear();
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        match timeout(write_timeout, socket.write_all(&buf)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("session {id}: write failed: {e}");
                break;
            }
            Err(_) => {
                warn!("session {id}: write timed out; dropping client");
                break;
            }
        }
    }
    let _ = socket.shutdown().await;
}
