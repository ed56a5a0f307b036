//! Application layer use cases for the vest daemon.
//!
//! # What lives here? (for beginners)
//!
//! This layer sits between the pure domain types and the infrastructure
//! (sockets, USB).  It decides *what* happens for each client command, but
//! reaches devices and clients only through traits:
//!
//! - [`VestBackend`](crate::infrastructure::device::VestBackend) to find and
//!   open vests,
//! - [`EventSink`](command_router::EventSink) to broadcast events.
//!
//! Tests swap both for in-memory doubles.
//!
//! # Sub-modules
//!
//! - **`command_router`**  – Validates each request, resolves its target
//!   device, and performs it.  Owns all mutable daemon state.
//! - **`device_registry`** – Known devices, connection states, and the main
//!   device pointer.
//! - **`player_mapping`**  – Player to device bindings and per-game slots.
//! - **`resolve`**         – Picks the device an effect command lands on.
//! - **`effect_playback`** – Timed preset playback and its per-device table.
//! - **`hotplug`**         – Periodic bus scan feeding the router.

pub mod command_router;
pub mod device_registry;
pub mod effect_playback;
pub mod hotplug;
pub mod player_mapping;
pub mod resolve;
