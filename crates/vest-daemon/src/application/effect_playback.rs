//! Timed playback of preset effects.
//!
//! A preset is a list of steps.  Each step switches a group of cells on,
//! holds for `duration_ms`, switches them off, then waits `delay_ms`:
//!
//! ```text
//!  step 1            step 2
//!  ┌── on ──┐        ┌── on ──┐
//!  │        │ delay  │        │
//! ─┘        └────────┘        └──
//! ```
//!
//! Playback runs as its own task and writes through the device's
//! [`JobSender`], so its frames queue up behind (and ahead of) single
//! triggers in the order they were enqueued.  At most one preset plays per
//! device; starting a new one or stopping replaces the old task.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::task::AbortHandle;
use vest_core::{CellCommand, Effect, EffectStep, PacketError, CELL_COUNT};

use crate::domain::DeviceId;
use crate::infrastructure::device::{JobSender, SubmitError, WriteError};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("device writer stopped")]
    WriterGone,
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// `off` frames for every cell.
pub fn all_off() -> Vec<CellCommand> {
    (0..CELL_COUNT)
        .filter_map(|cell| CellCommand::off(cell).ok())
        .collect()
}

fn step_frames(step: &EffectStep, speed: u8) -> Result<Vec<CellCommand>, PacketError> {
    step.cells
        .iter()
        .map(|&cell| CellCommand::new(cell, speed))
        .collect()
}

async fn write(jobs: &JobSender, frames: Vec<CellCommand>) -> Result<(), PlaybackError> {
    let done = jobs.submit(frames)?;
    done.await.map_err(|_| PlaybackError::WriterGone)??;
    Ok(())
}

/// Plays every step of `effect` and returns once the last cell is off.
///
/// # Errors
///
/// Stops at the first job that cannot be enqueued or written.
pub async fn play(effect: &'static Effect, jobs: JobSender) -> Result<(), PlaybackError> {
    for step in effect.steps {
        write(&jobs, step_frames(step, step.speed)?).await?;
        tokio::time::sleep(Duration::from_millis(u64::from(step.duration_ms))).await;
        write(&jobs, step_frames(step, 0)?).await?;
        if step.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(step.delay_ms))).await;
        }
    }
    Ok(())
}

struct ActivePlayback {
    id: u64,
    effect_name: &'static str,
    task: AbortHandle,
}

/// Which preset is playing on which device.
#[derive(Default)]
pub struct PlaybackTable {
    active: HashMap<DeviceId, ActivePlayback>,
    next_id: u64,
}

impl PlaybackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an id for a playback about to be spawned.
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Records a running playback, aborting any previous one on the device.
    ///
    /// Returns the name of the replaced effect.
    pub fn insert(
        &mut self,
        device_id: DeviceId,
        id: u64,
        effect_name: &'static str,
        task: AbortHandle,
    ) -> Option<&'static str> {
        let previous = self.active.insert(
            device_id,
            ActivePlayback {
                id,
                effect_name,
                task,
            },
        );
        previous.map(|p| {
            p.task.abort();
            p.effect_name
        })
    }

    /// Aborts the playback on `device_id`, returning the effect name.
    pub fn cancel(&mut self, device_id: &DeviceId) -> Option<&'static str> {
        self.active.remove(device_id).map(|p| {
            p.task.abort();
            p.effect_name
        })
    }

    /// Forgets a playback that ended on its own.
    ///
    /// Returns `false` if a newer playback has replaced it.
    pub fn finish(&mut self, device_id: &DeviceId, id: u64) -> bool {
        match self.active.get(device_id) {
            Some(p) if p.id == id => {
                self.active.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub fn playing(&self, device_id: &DeviceId) -> Option<&'static str> {
        self.active.get(device_id).map(|p| p.effect_name)
    }

    pub fn cancel_all(&mut self) {
        for (_, p) in self.active.drain() {
            p.task.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
