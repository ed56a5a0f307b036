//! # vest-core
//!
//! Shared library for the haptic vest daemon containing the hardware wire
//! codec, the physical cell layout, and the library of predefined effects.
//!
//! It has zero dependencies on USB stacks, sockets, or async runtimes, so the
//! codec can be tested bit-for-bit on any machine without hardware attached.
//!
//! # Architecture overview (for beginners)
//!
//! The vest has 8 vibration motors ("cells").  Each motor is driven by a tiny
//! 10-byte USB packet that says "run cell N at speed S".  The firmware only
//! accepts packets that were scrambled with a specific block cipher and that
//! carry a matching checksum, so the byte layout must be exact.
//!
//! This crate (`vest-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How one `(cell, speed)` command becomes 10 bytes on the
//!   wire: a fixed header, a key-index byte, and an 8-byte encrypted block.
//!
//! - **`domain`** – Pure data with no I/O: which cell index sits where on the
//!   body, and multi-step effect presets (machine gun, heartbeat, ...) built
//!   on top of single-cell commands.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `vest_core::encode` instead of `vest_core::protocol::packet::encode`.
pub use domain::effects::{find_effect, Effect, EffectCategory, EffectStep, EFFECTS};
pub use protocol::packet::{
    decode, encode, CellCommand, DecodedPacket, InvalidParameter, PacketError, CELL_COUNT,
    MAX_SPEED, PACKET_LEN,
};
