//! Target resolution for effect commands.
//!
//! ```text
//! device_id given?          ──yes──► must exist in the registry
//!      │ no
//! player_id assigned?       ──yes──► that player's device
//!      │ no / unknown
//! (game_id, player_num) mapped? ─yes─► that slot's device
//!      │ no
//! main device set?          ──yes──► main
//!      │ no
//!      └──► DeviceNotResolved
//! ```
//!
//! A player or slot that exists but points at a device that has since been
//! removed is an error rather than a fall-through: silently hitting the main
//! device instead would buzz the wrong person.

use crate::application::device_registry::DeviceRegistry;
use crate::application::player_mapping::{GameMappingTable, PlayerTable};
use crate::domain::{CommandError, DeviceId, TargetSelector};

/// Resolves `target` to exactly one registered device.
///
/// # Errors
///
/// [`CommandError::NotFound`] for an explicit `device_id` that is not
/// registered, and [`CommandError::DeviceNotResolved`] when a lookup points at
/// a stale device or no rule matches.
pub fn resolve_target(
    target: &TargetSelector,
    registry: &DeviceRegistry,
    players: &PlayerTable,
    games: &GameMappingTable,
) -> Result<DeviceId, CommandError> {
    if let Some(device_id) = &target.device_id {
        if registry.contains(device_id) {
            return Ok(device_id.clone());
        }
        return Err(CommandError::NotFound(format!("device not found: {device_id}")));
    }

    if let Some(player_id) = &target.player_id {
        if let Some(device_id) = players.get(player_id).and_then(|p| p.device_id.as_ref()) {
            return registered(
                registry,
                device_id,
                || format!("player {player_id} is assigned to missing device {device_id}"),
            );
        }
    }

    if let (Some(game_id), Some(player_num)) = (&target.game_id, target.player_num) {
        if let Some(device_id) = games.get(game_id, player_num) {
            return registered(registry, device_id, || {
                format!("game {game_id} player {player_num} is mapped to missing device {device_id}")
            });
        }
    }

    registry
        .main()
        .cloned()
        .ok_or_else(|| CommandError::DeviceNotResolved("no device resolved".to_owned()))
}

fn registered(
    registry: &DeviceRegistry,
    device_id: &DeviceId,
    message: impl FnOnce() -> String,
) -> Result<DeviceId, CommandError> {
    if registry.contains(device_id) {
        Ok(device_id.clone())
    } else {
        Err(CommandError::DeviceNotResolved(message()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
