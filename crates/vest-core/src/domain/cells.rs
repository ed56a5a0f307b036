//! Physical cell layout.
//!
//! ```text
//!       FRONT                    BACK
//!   ┌─────┬─────┐          ┌─────┬─────┐
//!   │  2  │  5  │  upper   │  1  │  6  │
//!   ├─────┼─────┤          ├─────┼─────┤
//!   │  3  │  4  │  lower   │  0  │  7  │
//!   └─────┴─────┘          └─────┴─────┘
//!     L     R                L     R
//! ```

pub const FRONT_UPPER_LEFT: u8 = 2;
pub const FRONT_UPPER_RIGHT: u8 = 5;
pub const FRONT_LOWER_LEFT: u8 = 3;
pub const FRONT_LOWER_RIGHT: u8 = 4;
pub const BACK_UPPER_LEFT: u8 = 1;
pub const BACK_UPPER_RIGHT: u8 = 6;
pub const BACK_LOWER_LEFT: u8 = 0;
pub const BACK_LOWER_RIGHT: u8 = 7;

pub const ALL_CELLS: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

pub const FRONT_CELLS: [u8; 4] = [
    FRONT_UPPER_LEFT,
    FRONT_UPPER_RIGHT,
    FRONT_LOWER_LEFT,
    FRONT_LOWER_RIGHT,
];

pub const BACK_CELLS: [u8; 4] = [
    BACK_UPPER_LEFT,
    BACK_UPPER_RIGHT,
    BACK_LOWER_LEFT,
    BACK_LOWER_RIGHT,
];

pub const LEFT_SIDE: [u8; 4] = [
    FRONT_UPPER_LEFT,
    FRONT_LOWER_LEFT,
    BACK_UPPER_LEFT,
    BACK_LOWER_LEFT,
];

pub const RIGHT_SIDE: [u8; 4] = [
    FRONT_UPPER_RIGHT,
    FRONT_LOWER_RIGHT,
    BACK_UPPER_RIGHT,
    BACK_LOWER_RIGHT,
];

pub const UPPER_CELLS: [u8; 4] = [
    FRONT_UPPER_LEFT,
    FRONT_UPPER_RIGHT,
    BACK_UPPER_LEFT,
    BACK_UPPER_RIGHT,
];

pub const LOWER_CELLS: [u8; 4] = [
    FRONT_LOWER_LEFT,
    FRONT_LOWER_RIGHT,
    BACK_LOWER_LEFT,
    BACK_LOWER_RIGHT,
];
