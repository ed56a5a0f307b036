//! Protocol module containing the block cipher, the checksum, and the packet codec.

pub mod checksum;
pub mod cipher;
pub mod packet;

pub use checksum::checksum;
pub use packet::{decode, encode, CellCommand, DecodedPacket, PacketError};
