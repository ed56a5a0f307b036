//! Network infrastructure: the client-facing TCP server.
//!
//! Clients speak newline-delimited JSON over plain TCP, by default on
//! `127.0.0.1:5050`.  Every line a client sends is one request; the daemon
//! answers with one response line to that client and pushes event lines to
//! all clients.
//!
//! - `framing`         – splits the byte stream into bounded lines.
//! - `session_manager` – per-client outbound queues, unicast and broadcast.
//! - `server`          – accept loop and per-session read/write tasks.

pub mod framing;
pub mod server;
pub mod session_manager;

pub use server::{serve, ServerSettings};
pub use session_manager::SessionManager;
