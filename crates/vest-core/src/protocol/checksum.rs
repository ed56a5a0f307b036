//! Nibble-substitution checksum carried inside every plaintext block.
//!
//! The firmware recomputes this byte after decrypting a packet and silently
//! ignores the packet when it does not match, so the table and the mixing
//! order below are part of the wire contract.

/// 4-bit substitution table (a permutation of `0..16`).
pub const NIBBLE_TABLE: [u8; 16] = [
    0xC, 0x5, 0x6, 0xB, 0x9, 0x0, 0xA, 0xD, 0x3, 0xE, 0xF, 0x8, 0x4, 0x7, 0x1, 0x2,
];

/// Computes the checksum byte for a `(cell, speed)` pair.
///
/// The high nibble substitutes `speed ^ cell`; the low nibble substitutes
/// `speed + cell + high`, so any change to either input moves the high nibble.
///
/// # Examples
///
/// ```rust
/// use vest_core::protocol::checksum;
///
/// assert_eq!(checksum(3, 7), checksum(3, 7));
/// assert_ne!(checksum(3, 7), checksum(2, 7));
/// ```
pub fn checksum(cell: u8, speed: u8) -> u8 {
    let high = substitute(speed ^ cell);
    let low = substitute(speed.wrapping_add(cell).wrapping_add(high));
    (high << 4) | low
}

#[inline]
fn substitute(value: u8) -> u8 {
    NIBBLE_TABLE[usize::from(value & 0x0F)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nibble_table_is_a_permutation() {
        let mut seen = [false; 16];
        for &n in NIBBLE_TABLE.iter() {
            assert!(!seen[usize::from(n)], "duplicate nibble {n:#x}");
            seen[usize::from(n)] = true;
        }
    }

    #[test]
    fn test_checksum_known_values() {
        // cell 0, speed 0: high = T[0] = 0xC, low = T[0xC] = 0x4
        assert_eq!(checksum(0, 0), 0xC4);
        // cell 2, speed 5: high = T[7] = 0xD, low = T[(5+2+13) & 0xF = 4] = 0x9
        assert_eq!(checksum(2, 5), 0xD9);
    }

    #[test]
    fn test_checksum_is_deterministic() {
        for cell in 0..8u8 {
            for speed in 0..=10u8 {
                assert_eq!(checksum(cell, speed), checksum(cell, speed));
            }
        }
    }

    #[test]
    fn test_single_bit_flip_in_inputs_changes_checksum() {
        for cell in 0..8u8 {
            for speed in 0..=10u8 {
                let base = checksum(cell, speed);
                for bit in 0..3 {
                    assert_ne!(base, checksum(cell ^ (1 << bit), speed), "cell bit {bit}");
                }
                for bit in 0..4 {
                    assert_ne!(base, checksum(cell, speed ^ (1 << bit)), "speed bit {bit}");
                }
            }
        }
    }
}
