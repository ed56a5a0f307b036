//! 64-bit block cipher applied to every hardware command packet.
//!
//! The structure is the classic XTEA Feistel network:
//!
//! ```text
//! block  = [v0:4][v1:4]          (both words big-endian)
//! key    = [k0][k1][k2][k3]      (four 32-bit words)
//! rounds = 32, delta = 0x9E3779B9 (derived from the golden ratio)
//! ```
//!
//! # Why a cipher at all? (for beginners)
//!
//! The vest firmware refuses packets that were not scrambled with the vendor
//! cipher.  There is nothing secret here: the key ships with every copy of the
//! vendor SDK.  The cipher exists purely so that the bytes we emit are the
//! bytes the firmware's decoder expects.

/// Number of Feistel rounds (each round updates both halves once).
pub const ROUNDS: u32 = 32;

/// Round constant, `floor(2^32 / golden_ratio)`.
pub const DELTA: u32 = 0x9E37_79B9;

/// A 128-bit cipher key expressed as four 32-bit words.
pub type Key = [u32; 4];

/// Encrypts one 8-byte block in place of the plaintext.
///
/// # Examples
///
/// ```rust
/// use vest_core::protocol::cipher::{decrypt_block, encrypt_block};
///
/// let key = [1, 2, 3, 4];
/// let plain = *b"vestdata";
/// let scrambled = encrypt_block(plain, &key);
/// assert_ne!(scrambled, plain);
/// assert_eq!(decrypt_block(scrambled, &key), plain);
/// ```
pub fn encrypt_block(block: [u8; 8], key: &Key) -> [u8; 8] {
    let (mut v0, mut v1) = split(block);
    let mut sum: u32 = 0;

    for _ in 0..ROUNDS {
        v0 = v0.wrapping_add(mix(v1) ^ sum.wrapping_add(key[(sum & 3) as usize]));
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(mix(v0) ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]));
    }

    join(v0, v1)
}

/// Inverts [`encrypt_block`].
pub fn decrypt_block(block: [u8; 8], key: &Key) -> [u8; 8] {
    let (mut v0, mut v1) = split(block);
    let mut sum: u32 = DELTA.wrapping_mul(ROUNDS);

    for _ in 0..ROUNDS {
        v1 = v1.wrapping_sub(mix(v0) ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]));
        sum = sum.wrapping_sub(DELTA);
        v0 = v0.wrapping_sub(mix(v1) ^ sum.wrapping_add(key[(sum & 3) as usize]));
    }

    join(v0, v1)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

#[inline]
fn mix(v: u32) -> u32 {
    ((v << 4) ^ (v >> 5)).wrapping_add(v)
}

#[inline]
fn split(block: [u8; 8]) -> (u32, u32) {
    (
        u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
        u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
    )
}

#[inline]
fn join(v0: u32, v1: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&v0.to_be_bytes());
    out[4..].copy_from_slice(&v1.to_be_bytes());
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
