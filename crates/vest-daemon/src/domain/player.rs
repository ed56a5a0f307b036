//! Players and per-game player slots.

use serde::Serialize;

use crate::domain::device::DeviceId;

/// A named participant that may be bound to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Player {
    pub player_id: String,
    pub device_id: Option<DeviceId>,
    pub name: Option<String>,
}

/// "In game `game_id`, player number `player_num` wears `device_id`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GamePlayerMapping {
    pub game_id: String,
    pub player_num: u32,
    pub device_id: DeviceId,
}
