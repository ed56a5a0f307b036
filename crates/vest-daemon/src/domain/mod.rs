//! Domain layer for vest-daemon.
//!
//! Pure types with no dependencies on sockets, USB, or the async runtime:
//!
//! - Device identity and descriptors (`device`)
//! - Players and per-game player slots (`player`)
//! - The line-delimited JSON language spoken with clients (`messages`)
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, or `nusb` types
//! - File I/O or environment variable reading
//! - Anything that could block or fail due to external state

pub mod device;
pub mod messages;
pub mod player;

pub use device::{ConnectionState, DeviceDescriptor, DeviceId, DeviceSelector};
pub use messages::{
    parse_request, Command, CommandError, DisconnectReason, Event, EventPayload, FramingError,
    Request, Response, TargetSelector,
};
pub use player::{GamePlayerMapping, Player};
