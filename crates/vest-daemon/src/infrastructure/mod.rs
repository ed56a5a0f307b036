//! Infrastructure layer for vest-daemon.
//!
//! Everything that touches the outside world lives here:
//!
//! - `device`    – USB discovery, transports, mock vests, per-device writers
//! - `network`   – TCP accept loop and client sessions
//! - `storage`   – TOML configuration loading
//! - `lifecycle` – PID file management
//! - `runtime`   – wires the layers together into a running daemon
//!
//! # What does NOT belong here?
//!
//! - Deciding which device a command targets (application layer)
//! - Message type definitions (domain layer)

pub mod device;
pub mod lifecycle;
pub mod network;
pub mod runtime;
pub mod storage;
