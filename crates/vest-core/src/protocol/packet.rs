//! Encoding and decoding of the 10-byte hardware command packet.
//!
//! Wire format:
//! ```text
//! [header:1][key_index:1][E(block):8]
//!
//! block = [0][0][0][0][speed][cell][checksum(cell, speed)][0]
//! ```
//!
//! `E` is [`crate::protocol::cipher::encrypt_block`] keyed by the entry of the
//! key table selected by `key_index`.  The daemon always sends the same key
//! index; the byte stays on the wire so a full key table can be reinstated
//! without changing the packet layout.
//!
//! The device never answers, so [`decode`] is only used by tests and
//! diagnostics to prove that [`encode`] produced something the firmware's
//! decoder would accept.

use std::fmt;

use thiserror::Error;

use crate::protocol::checksum::checksum;
use crate::protocol::cipher::{decrypt_block, encrypt_block, Key};

/// Total length of one hardware packet in bytes.
pub const PACKET_LEN: usize = 10;

/// First byte of every packet.
pub const PACKET_HEADER: u8 = 0x02;

/// Key index written into byte 1 of every packet.
pub const KEY_INDEX: u8 = 0x00;

/// Number of addressable cells; valid indices are `0..CELL_COUNT`.
pub const CELL_COUNT: u8 = 8;

/// Highest accepted speed.  Speed 0 switches a cell off.
pub const MAX_SPEED: u8 = 10;

/// Key table indexed by the key-index byte.
const KEY_TABLE: [Key; 1] = [[0x7A31_C4E9, 0x0B5D_92F6, 0xE4A8_1573, 0x3C6F_D80B]];

/// Which effect parameter was rejected.
///
/// The `Display` text is what clients see in `error` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidParameter {
    Cell(u8),
    Speed(u8),
}

impl fmt::Display for InvalidParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidParameter::Cell(_) => f.write_str("invalid cell"),
            InvalidParameter::Speed(_) => f.write_str("invalid speed"),
        }
    }
}

/// Errors that can occur while encoding or decoding a packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The cell index or speed is out of range.  Raised before any I/O.
    #[error("{0}")]
    InvalidEffectParameters(InvalidParameter),

    /// The byte slice is not exactly [`PACKET_LEN`] bytes long.
    #[error("packet must be 10 bytes, got {0}")]
    WrongLength(usize),

    /// Byte 0 is not [`PACKET_HEADER`].
    #[error("unexpected header byte: 0x{0:02X}")]
    BadHeader(u8),

    /// Byte 1 does not select an entry of the key table.
    #[error("unknown key index: {0}")]
    UnknownKeyIndex(u8),

    /// The decrypted block has non-zero padding bytes.
    #[error("malformed plaintext block")]
    MalformedBlock,

    /// The checksum byte does not match the decrypted cell and speed.
    #[error("checksum mismatch: expected 0x{expected:02X}, found 0x{found:02X}")]
    ChecksumMismatch { expected: u8, found: u8 },
}

/// A validated single-cell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellCommand {
    pub cell: u8,
    pub speed: u8,
}

impl CellCommand {
    /// Validates `cell` and `speed` and builds the command.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::InvalidEffectParameters`] when `cell >= 8` or
    /// `speed > 10`.
    pub fn new(cell: u8, speed: u8) -> Result<Self, PacketError> {
        validate(cell, speed)?;
        Ok(Self { cell, speed })
    }

    /// A speed-0 command that switches `cell` off.
    pub fn off(cell: u8) -> Result<Self, PacketError> {
        Self::new(cell, 0)
    }

    /// Encodes this command into a wire packet.
    pub fn encode(self) -> [u8; PACKET_LEN] {
        seal(self.cell, self.speed)
    }
}

/// Fields recovered from a decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket {
    pub cell: u8,
    pub speed: u8,
    pub checksum: u8,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a `(cell, speed)` pair into a 10-byte hardware packet.
///
/// # Errors
///
/// Returns [`PacketError::InvalidEffectParameters`] if `cell` is not in
/// `0..=7` or `speed` is not in `0..=10`.  Nothing is produced in that case,
/// so a caller can never write a partial or garbage packet.
///
/// # Examples
///
/// ```rust
/// use vest_core::{decode, encode};
///
/// let bytes = encode(4, 7).unwrap();
/// let decoded = decode(&bytes).unwrap();
/// assert_eq!((decoded.cell, decoded.speed), (4, 7));
/// ```
pub fn encode(cell: u8, speed: u8) -> Result<[u8; PACKET_LEN], PacketError> {
    validate(cell, speed)?;
    Ok(seal(cell, speed))
}

/// Decodes and verifies a packet produced by [`encode`].
///
/// # Errors
///
/// Returns [`PacketError`] if the length, header, key index, padding,
/// parameters, or checksum are wrong.
pub fn decode(bytes: &[u8]) -> Result<DecodedPacket, PacketError> {
    if bytes.len() != PACKET_LEN {
        return Err(PacketError::WrongLength(bytes.len()));
    }
    if bytes[0] != PACKET_HEADER {
        return Err(PacketError::BadHeader(bytes[0]));
    }
    let key = KEY_TABLE
        .get(usize::from(bytes[1]))
        .ok_or(PacketError::UnknownKeyIndex(bytes[1]))?;

    let mut block = [0u8; 8];
    block.copy_from_slice(&bytes[2..]);
    let plain = decrypt_block(block, key);

    if plain[..4] != [0, 0, 0, 0] || plain[7] != 0 {
        return Err(PacketError::MalformedBlock);
    }

    let (speed, cell, found) = (plain[4], plain[5], plain[6]);
    validate(cell, speed)?;

    let expected = checksum(cell, speed);
    if found != expected {
        return Err(PacketError::ChecksumMismatch { expected, found });
    }

    Ok(DecodedPacket {
        cell,
        speed,
        checksum: found,
    })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn validate(cell: u8, speed: u8) -> Result<(), PacketError> {
    if cell >= CELL_COUNT {
        return Err(PacketError::InvalidEffectParameters(InvalidParameter::Cell(cell)));
    }
    if speed > MAX_SPEED {
        return Err(PacketError::InvalidEffectParameters(InvalidParameter::Speed(speed)));
    }
    Ok(())
}

fn seal(cell: u8, speed: u8) -> [u8; PACKET_LEN] {
    let block = [0, 0, 0, 0, speed, cell, checksum(cell, speed), 0];
    let encrypted = encrypt_block(block, &KEY_TABLE[usize::from(KEY_INDEX)]);

    let mut packet = [0u8; PACKET_LEN];
    packet[0] = PACKET_HEADER;
    packet[1] = KEY_INDEX;
    packet[2..].copy_from_slice(&encrypted);
    packet
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_writes_header_and_key_index() {
        // Arrange / Act
        let packet = encode(0, 1).expect("valid parameters");

        // Assert
        assert_eq!(packet.len(), PACKET_LEN);
        assert_eq!(packet[0], PACKET_HEADER);
        assert_eq!(packet[1], KEY_INDEX);
    }

    #[test]
    fn test_encode_is_deterministic() {
        assert_eq!(encode(5, 9).unwrap(), encode(5, 9).unwrap());
    }

    #[test]
    fn test_encode_rejects_cell_out_of_range() {
        let result = encode(8, 5);
        assert_eq!(
            result,
            Err(PacketError::InvalidEffectParameters(InvalidParameter::Cell(8)))
        );
    }

    #[test]
    fn test_encode_rejects_speed_out_of_range() {
        let result = encode(0, 11);
        assert_eq!(
            result,
            Err(PacketError::InvalidEffectParameters(InvalidParameter::Speed(11)))
        );
    }

    #[test]
    fn test_invalid_parameter_messages_are_client_facing() {
        let cell = PacketError::InvalidEffectParameters(InvalidParameter::Cell(9));
        let speed = PacketError::InvalidEffectParameters(InvalidParameter::Speed(42));
        assert_eq!(cell.to_string(), "invalid cell");
        assert_eq!(speed.to_string(), "invalid speed");
    }

    #[test]
    fn test_speed_zero_is_accepted_for_stop() {
        let off = CellCommand::off(3).expect("speed 0 is valid");
        assert_eq!(off.speed, 0);
        assert_eq!(decode(&off.encode()).unwrap().speed, 0);
    }

    #[test]
    fn test_cell_command_encode_matches_free_function() {
        let cmd = CellCommand::new(6, 4).unwrap();
        assert_eq!(cmd.encode(), encode(6, 4).unwrap());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(decode(&[0u8; 9]), Err(PacketError::WrongLength(9)));
        assert_eq!(decode(&[0u8; 11]), Err(PacketError::WrongLength(11)));
    }

    #[test]
    fn test_decode_rejects_bad_header() {
        let mut packet = encode(1, 1).unwrap();
        packet[0] = 0xFF;
        assert_eq!(decode(&packet), Err(PacketError::BadHeader(0xFF)));
    }

    #[test]
    fn test_decode_rejects_unknown_key_index() {
        let mut packet = encode(1, 1).unwrap();
        packet[1] = 0x07;
        assert_eq!(decode(&packet), Err(PacketError::UnknownKeyIndex(0x07)));
    }

    #[test]
    fn test_distinct_commands_produce_distinct_packets() {
        let mut seen = std::collections::HashSet::new();
        for cell in 0..CELL_COUNT {
            for speed in 0..=MAX_SPEED {
                assert!(seen.insert(encode(cell, speed).unwrap()));
            }
        }
    }
}
