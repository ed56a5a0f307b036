//! Registry of connected client sessions and their outbound queues.
//!
//! Each session owns a bounded channel drained by its own writer task.
//! Responses go to one session; events go to all of them.  Sending never
//! waits: a session whose queue is full (a client that stopped reading) is
//! dropped instead of slowing everyone else down.
//!
//! ```text
//!                       ┌─► [queue A] ─► writer A ─► socket A
//!  router ─► broadcast ─┼─► [queue B] ─► writer B ─► socket B
//!                       └─► [queue C]  (full → session C dropped)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::command_router::EventSink;
use crate::domain::Event;

/// Short random session identifier.
pub type SessionId = String;

/// One queued outbound line, shared between all recipients of a broadcast.
pub type OutboundLine = Arc<str>;

/// All live sessions.
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, mpsc::Sender<OutboundLine>>>,
    buffer: usize,
}

impl SessionManager {
    /// `buffer` is the per-session outbound queue capacity.
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, mpsc::Sender<OutboundLine>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a session and returns its id and the receiving end of its queue.
    pub fn register(&self) -> (SessionId, mpsc::Receiver<OutboundLine>) {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.sessions().insert(id.clone(), tx);
        debug!("session {id}: registered");
        (id, rx)
    }

    /// Removes a session.  Its writer drains what is queued, then stops.
    pub fn unregister(&self, id: &str) -> bool {
        self.sessions().remove(id).is_some()
    }

    /// Queues a line for one session.
    ///
    /// Returns `false` if the session is gone or was dropped because its
    /// queue was full.
    pub fn send_to(&self, id: &str, line: impl Into<OutboundLine>) -> bool {
        let mut sessions = self.sessions();
        let Some(tx) = sessions.get(id) else {
            return false;
        };
        match tx.try_send(line.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("session {id}: outbound queue full, dropping client");
                sessions.remove(id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                sessions.remove(id);
                false
            }
        }
    }

    /// Queues a line for every session.  Returns how many accepted it.
    pub fn broadcast(&self, line: impl Into<OutboundLine>) -> usize {
        let line = line.into();
        let mut sessions = self.sessions();
        let mut dropped = Vec::new();

        for (id, tx) in sessions.iter() {
            match tx.try_send(Arc::clone(&line)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("session {id}: outbound queue full, dropping client");
                    dropped.push(id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(id.clone()),
            }
        }
        for id in &dropped {
            sessions.remove(id);
        }
        sessions.len()
    }

    pub fn count(&self) -> usize {
        self.sessions().len()
    }
}

impl EventSink for SessionManager {
    fn publish(&self, event: Event) {
        self.broadcast(event.to_line());
    }

    fn session_count(&self) -> usize {
        self.count()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
