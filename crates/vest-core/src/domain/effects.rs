//! Predefined multi-step haptic effects.
//!
//! Each [`Effect`] is a list of [`EffectStep`]s.  A step drives a set of cells
//! at one speed for `duration_ms`, switches them off, then waits `delay_ms`
//! before the next step:
//!
//! ```text
//! step 1: cells on ──duration──▶ cells off ──delay──▶
//! step 2: cells on ──duration──▶ cells off ──delay──▶ ...
//! ```
//!
//! The table below is static data; playback timing lives in the daemon.

use serde::Serialize;

use crate::domain::cells::{
    ALL_CELLS, BACK_CELLS, BACK_LOWER_LEFT, BACK_LOWER_RIGHT, BACK_UPPER_LEFT, BACK_UPPER_RIGHT,
    FRONT_CELLS, FRONT_LOWER_LEFT, FRONT_LOWER_RIGHT, FRONT_UPPER_LEFT, FRONT_UPPER_RIGHT,
    LEFT_SIDE, LOWER_CELLS, RIGHT_SIDE, UPPER_CELLS,
};

/// Grouping used by UIs to organise the effect list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectCategory {
    Weapons,
    Impacts,
    Melee,
    Driving,
    Special,
}

impl EffectCategory {
    /// Every category, in display order.
    pub const ALL: [EffectCategory; 5] = [
        EffectCategory::Weapons,
        EffectCategory::Impacts,
        EffectCategory::Melee,
        EffectCategory::Driving,
        EffectCategory::Special,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EffectCategory::Weapons => "weapons",
            EffectCategory::Impacts => "impacts",
            EffectCategory::Melee => "melee",
            EffectCategory::Driving => "driving",
            EffectCategory::Special => "special",
        }
    }
}

/// One timed step of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectStep {
    pub cells: &'static [u8],
    pub speed: u8,
    pub duration_ms: u32,
    pub delay_ms: u32,
}

/// A named preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    pub name: &'static str,
    pub display_name: &'static str,
    pub category: EffectCategory,
    pub description: &'static str,
    pub steps: &'static [EffectStep],
}

impl Effect {
    /// Sum of every step's active time and trailing delay.
    pub fn total_duration_ms(&self) -> u32 {
        self.steps.iter().map(|s| s.duration_ms + s.delay_ms).sum()
    }

    /// Distinct cells touched by any step, ascending.
    pub fn cells(&self) -> Vec<u8> {
        let mut cells: Vec<u8> = self.steps.iter().flat_map(|s| s.cells.iter().copied()).collect();
        cells.sort_unstable();
        cells.dedup();
        cells
    }
}

/// Looks up a preset by its `name`.
pub fn find_effect(name: &str) -> Option<&'static Effect> {
    EFFECTS.iter().find(|e| e.name == name)
}

const fn step(cells: &'static [u8], speed: u8, duration_ms: u32, delay_ms: u32) -> EffectStep {
    EffectStep {
        cells,
        speed,
        duration_ms,
        delay_ms,
    }
}

const FRONT_UPPER: &[u8] = &[FRONT_UPPER_LEFT, FRONT_UPPER_RIGHT];
const FRONT_LOWER: &[u8] = &[FRONT_LOWER_LEFT, FRONT_LOWER_RIGHT];
const BACK_UPPER: &[u8] = &[BACK_UPPER_LEFT, BACK_UPPER_RIGHT];
const BACK_LOWER: &[u8] = &[BACK_LOWER_LEFT, BACK_LOWER_RIGHT];
const FRONT_LEFT_COLUMN: &[u8] = &[FRONT_UPPER_LEFT, FRONT_LOWER_LEFT];
const BACK_LEFT_COLUMN: &[u8] = &[BACK_LOWER_LEFT, BACK_UPPER_LEFT];

// ── Effect table ──────────────────────────────────────────────────────────────

/// All presets, grouped by category.
pub static EFFECTS: &[Effect] = &[
    // Weapons
    Effect {
        name: "machinegun_front",
        display_name: "Machine Gun (Front)",
        category: EffectCategory::Weapons,
        description: "Rapid fire pulses to front",
        steps: &[
            step(FRONT_UPPER, 6, 50, 30),
            step(FRONT_LOWER, 6, 50, 30),
            step(FRONT_UPPER, 6, 50, 30),
            step(FRONT_LOWER, 6, 50, 30),
            step(FRONT_UPPER, 6, 50, 30),
            step(FRONT_LOWER, 6, 50, 0),
        ],
    },
    Effect {
        name: "machinegun_back",
        display_name: "Machine Gun (Back)",
        category: EffectCategory::Weapons,
        description: "Rapid fire pulses to back",
        steps: &[
            step(BACK_UPPER, 6, 50, 30),
            step(BACK_LOWER, 6, 50, 30),
            step(BACK_UPPER, 6, 50, 30),
            step(BACK_LOWER, 6, 50, 30),
            step(BACK_UPPER, 6, 50, 30),
            step(BACK_LOWER, 6, 50, 0),
        ],
    },
    Effect {
        name: "pistol_front",
        display_name: "Pistol (Front)",
        category: EffectCategory::Weapons,
        description: "Single handgun shot to front",
        steps: &[step(FRONT_UPPER, 5, 80, 0)],
    },
    Effect {
        name: "pistol_back",
        display_name: "Pistol (Back)",
        category: EffectCategory::Weapons,
        description: "Single handgun shot to back",
        steps: &[step(BACK_UPPER, 5, 80, 0)],
    },
    Effect {
        name: "shotgun_front",
        display_name: "Shotgun (Front)",
        category: EffectCategory::Weapons,
        description: "Heavy shotgun blast to front",
        steps: &[step(&FRONT_CELLS, 8, 150, 0)],
    },
    Effect {
        name: "shotgun_back",
        display_name: "Shotgun (Back)",
        category: EffectCategory::Weapons,
        description: "Heavy shotgun blast to back",
        steps: &[step(&BACK_CELLS, 8, 150, 0)],
    },
    Effect {
        name: "rifle_front",
        display_name: "Rifle (Front)",
        category: EffectCategory::Weapons,
        description: "Rifle shot to front",
        steps: &[step(FRONT_UPPER, 7, 100, 0), step(FRONT_LOWER, 5, 50, 0)],
    },
    Effect {
        name: "rifle_back",
        display_name: "Rifle (Back)",
        category: EffectCategory::Weapons,
        description: "Rifle shot to back",
        steps: &[step(BACK_UPPER, 7, 100, 0), step(BACK_LOWER, 5, 50, 0)],
    },
    // Impacts
    Effect {
        name: "big_blast_front",
        display_name: "Big Blast (Front)",
        category: EffectCategory::Impacts,
        description: "Large explosion impact to front",
        steps: &[
            step(&FRONT_CELLS, 10, 200, 0),
            step(&FRONT_CELLS, 7, 150, 0),
            step(&FRONT_CELLS, 4, 100, 0),
        ],
    },
    Effect {
        name: "big_blast_back",
        display_name: "Big Blast (Back)",
        category: EffectCategory::Impacts,
        description: "Large explosion impact to back",
        steps: &[
            step(&BACK_CELLS, 10, 200, 0),
            step(&BACK_CELLS, 7, 150, 0),
            step(&BACK_CELLS, 4, 100, 0),
        ],
    },
    Effect {
        name: "small_blast_front",
        display_name: "Small Blast (Front)",
        category: EffectCategory::Impacts,
        description: "Small explosion impact to front",
        steps: &[step(&FRONT_CELLS, 6, 100, 0), step(FRONT_UPPER, 3, 50, 0)],
    },
    Effect {
        name: "small_blast_back",
        display_name: "Small Blast (Back)",
        category: EffectCategory::Impacts,
        description: "Small explosion impact to back",
        steps: &[step(&BACK_CELLS, 6, 100, 0), step(BACK_UPPER, 3, 50, 0)],
    },
    Effect {
        name: "left_side_hit",
        display_name: "Left Side Hit",
        category: EffectCategory::Impacts,
        description: "Impact from the left",
        steps: &[step(&LEFT_SIDE, 7, 150, 0)],
    },
    Effect {
        name: "right_side_hit",
        display_name: "Right Side Hit",
        category: EffectCategory::Impacts,
        description: "Impact from the right",
        steps: &[step(&RIGHT_SIDE, 7, 150, 0)],
    },
    // Melee
    Effect {
        name: "punch_front",
        display_name: "Punch (Front)",
        category: EffectCategory::Melee,
        description: "Punch impact to front",
        steps: &[step(FRONT_LOWER, 7, 100, 0)],
    },
    Effect {
        name: "punch_back",
        display_name: "Punch (Back)",
        category: EffectCategory::Melee,
        description: "Punch impact to back",
        steps: &[step(BACK_LOWER, 7, 100, 0)],
    },
    Effect {
        name: "stab_front",
        display_name: "Stab (Front)",
        category: EffectCategory::Melee,
        description: "Stab impact to front",
        steps: &[
            step(&[FRONT_LOWER_LEFT], 9, 80, 0),
            step(&[FRONT_LOWER_LEFT, FRONT_UPPER_LEFT], 5, 100, 0),
        ],
    },
    Effect {
        name: "stab_back",
        display_name: "Stab (Back)",
        category: EffectCategory::Melee,
        description: "Stab impact to back",
        steps: &[step(&[BACK_LOWER_LEFT], 9, 80, 0), step(BACK_LEFT_COLUMN, 5, 100, 0)],
    },
    // Driving
    Effect {
        name: "acceleration",
        display_name: "Acceleration",
        category: EffectCategory::Driving,
        description: "G-force pushing back",
        steps: &[
            step(FRONT_UPPER, 3, 100, 0),
            step(FRONT_LOWER, 4, 100, 0),
            step(BACK_UPPER, 5, 150, 0),
            step(BACK_LOWER, 6, 200, 0),
        ],
    },
    Effect {
        name: "deceleration",
        display_name: "Deceleration",
        category: EffectCategory::Driving,
        description: "G-force pushing forward",
        steps: &[
            step(BACK_LOWER, 3, 100, 0),
            step(BACK_UPPER, 4, 100, 0),
            step(FRONT_LOWER, 5, 150, 0),
            step(FRONT_UPPER, 6, 200, 0),
        ],
    },
    Effect {
        name: "left_turn",
        display_name: "Left Turn",
        category: EffectCategory::Driving,
        description: "G-force from turning left",
        steps: &[step(&RIGHT_SIDE, 5, 300, 0)],
    },
    Effect {
        name: "right_turn",
        display_name: "Right Turn",
        category: EffectCategory::Driving,
        description: "G-force from turning right",
        steps: &[step(&LEFT_SIDE, 5, 300, 0)],
    },
    // Special
    Effect {
        name: "heartbeat",
        display_name: "Heartbeat",
        category: EffectCategory::Special,
        description: "Low health heartbeat pulse",
        steps: &[
            step(FRONT_LEFT_COLUMN, 4, 100, 50),
            step(FRONT_LEFT_COLUMN, 3, 80, 400),
            step(FRONT_LEFT_COLUMN, 4, 100, 50),
            step(FRONT_LEFT_COLUMN, 3, 80, 0),
        ],
    },
    Effect {
        name: "full_body_pulse",
        display_name: "Full Body Pulse",
        category: EffectCategory::Special,
        description: "Single pulse across entire vest",
        steps: &[step(&ALL_CELLS, 6, 200, 0)],
    },
    Effect {
        name: "death",
        display_name: "Death",
        category: EffectCategory::Special,
        description: "Death/respawn effect",
        steps: &[
            step(&ALL_CELLS, 10, 300, 0),
            step(&ALL_CELLS, 7, 200, 0),
            step(&ALL_CELLS, 4, 150, 0),
            step(&FRONT_CELLS, 2, 100, 0),
        ],
    },
    Effect {
        name: "spawn",
        display_name: "Spawn",
        category: EffectCategory::Special,
        description: "Respawn/start effect",
        steps: &[
            step(FRONT_LOWER, 3, 100, 0),
            step(&FRONT_CELLS, 5, 100, 0),
            step(&ALL_CELLS, 4, 150, 0),
            step(&ALL_CELLS, 2, 100, 0),
        ],
    },
    Effect {
        name: "shoulder_tap",
        display_name: "Shoulder Tap",
        category: EffectCategory::Special,
        description: "Light tap across both shoulders",
        steps: &[step(&UPPER_CELLS, 3, 80, 0)],
    },
    Effect {
        name: "gut_punch",
        display_name: "Gut Punch",
        category: EffectCategory::Melee,
        description: "Heavy blow to the torso",
        steps: &[step(&LOWER_CELLS, 9, 120, 0), step(FRONT_LOWER, 4, 80, 0)],
    },
];

// ── Tests ─────────────────────────────────────────────────────────────────────
