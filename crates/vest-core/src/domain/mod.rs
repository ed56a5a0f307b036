//! Domain data for the vest: the physical cell layout and effect presets.
//!
//! Nothing here performs I/O.  A preset is just data describing which cells to
//! drive, how hard, and for how long; the daemon turns it into queued writes.

/// Physical placement of the 8 cells and the common groupings of them.
pub mod cells;

/// Library of named multi-step effects.
pub mod effects;
