//! vest-daemon library crate.
//!
//! A local control daemon that lets many client programs (games, mods,
//! scripts) drive one or more haptic vests at the same time.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Clients (newline-delimited JSON over TCP 127.0.0.1:5050)
//!         ↕
//! [vest-daemon]
//!   ├── domain/          Pure types: device ids, players, request/response/event
//!   ├── application/     Command routing, device registry, target resolution,
//!   │                    effect playback, hot-plug reconciliation
//!   └── infrastructure/
//!         ├── device/    USB backend (nusb), mock vests, per-device writers
//!         ├── network/   Accept loop, sessions, line framing
//!         ├── storage/   TOML config
//!         └── runtime    Wires it all together
//!         ↕
//! Vests (10-byte encrypted packets on a USB interrupt endpoint, vest-core)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain`, `vest-core`, and the device traits.
//! - `infrastructure` depends on everything plus `tokio` and `nusb`.
//!
//! # For beginners: where does a command go?
//!
//! A line arrives on a session, is parsed into a [`domain::Request`], handed
//! to the shared [`application::command_router::CommandRouter`], resolved to a
//! device, queued on that device's single writer, and answered.  Any state
//! change is also broadcast to every session as an event.

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: command handling and daemon state.
pub mod application;

/// Infrastructure layer: USB, TCP, config, and process lifecycle.
pub mod infrastructure;
