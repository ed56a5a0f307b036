//! Player table and per-game player slot table.
//!
//! Both tables are in-memory only.  They store device ids but do not own
//! devices; the router validates ids against the registry before storing
//! them, and resolution re-checks them at use time.

use std::collections::{BTreeMap, HashMap};

use crate::domain::{DeviceId, GamePlayerMapping, Player};

/// Players keyed by id.
#[derive(Debug, Default)]
pub struct PlayerTable {
    players: HashMap<String, Player>,
}

impl PlayerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a player, or updates the name of an existing one.
    pub fn create(&mut self, player_id: &str, name: Option<String>) -> Player {
        let player = self
            .players
            .entry(player_id.to_owned())
            .or_insert_with(|| Player {
                player_id: player_id.to_owned(),
                device_id: None,
                name: None,
            });
        if name.is_some() {
            player.name = name;
        }
        player.clone()
    }

    pub fn remove(&mut self, player_id: &str) -> Option<Player> {
        self.players.remove(player_id)
    }

    /// Binds a player to a device, creating the player if needed.
    pub fn assign(&mut self, player_id: &str, device_id: DeviceId) -> Player {
        let mut player = self.create(player_id, None);
        player.device_id = Some(device_id);
        self.players.insert(player_id.to_owned(), player.clone());
        player
    }

    /// Clears a player's device.  `None` if the player does not exist.
    pub fn unassign(&mut self, player_id: &str) -> Option<Player> {
        let player = self.players.get_mut(player_id)?;
        player.device_id = None;
        Some(player.clone())
    }

    pub fn get(&self, player_id: &str) -> Option<&Player> {
        self.players.get(player_id)
    }

    /// All players sorted by id.
    pub fn list(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self.players.values().cloned().collect();
        players.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        players
    }
}

/// `game_id → player_num → device_id`.
#[derive(Debug, Default)]
pub struct GameMappingTable {
    games: BTreeMap<String, BTreeMap<u32, DeviceId>>,
}

impl GameMappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, game_id: &str, player_num: u32, device_id: DeviceId) -> GamePlayerMapping {
        self.games
            .entry(game_id.to_owned())
            .or_default()
            .insert(player_num, device_id.clone());
        GamePlayerMapping {
            game_id: game_id.to_owned(),
            player_num,
            device_id,
        }
    }

    /// Clears one slot, or the whole game when `player_num` is `None`.
    ///
    /// A game left with no slots is removed.  Returns whether anything was
    /// cleared.
    pub fn clear(&mut self, game_id: &str, player_num: Option<u32>) -> bool {
        let Some(slots) = self.games.get_mut(game_id) else {
            return false;
        };
        let cleared = match player_num {
            Some(num) => slots.remove(&num).is_some(),
            None => {
                let had_any = !slots.is_empty();
                slots.clear();
                had_any
            }
        };
        if slots.is_empty() {
            self.games.remove(game_id);
        }
        cleared
    }

    pub fn get(&self, game_id: &str, player_num: u32) -> Option<&DeviceId> {
        self.games.get(game_id)?.get(&player_num)
    }

    /// All mappings, optionally limited to one game, ordered by game then slot.
    pub fn list(&self, game_id: Option<&str>) -> Vec<GamePlayerMapping> {
        self.games
            .iter()
            .filter(|(game, _)| game_id.map_or(true, |wanted| wanted == game.as_str()))
            .flat_map(|(game, slots)| {
                slots.iter().map(move |(num, device)| GamePlayerMapping {
                    game_id: game.clone(),
                    player_num: *num,
                    device_id: device.clone(),
                })
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_player_is_idempotent_and_updates_name() {
        // Arrange
        let mut players = PlayerTable::new();
        players.create("p1", None);
        players.assign("p1", DeviceId::new("mock_1"));

        // Act
        let player = players.create("p1", Some("Alice".into()));

        // Assert
        assert_eq!(player.name.as_deref(), Some("Alice"));
        assert_eq!(player.device_id, Some(DeviceId::new("mock_1")));
        assert_eq!(players.list().len(), 1);
    }

    #[test]
    fn test_assign_creates_missing_player() {
        let mut players = PlayerTable::new();

        let player = players.assign("p2", DeviceId::new("mock_2"));

        assert_eq!(player.player_id, "p2");
        assert_eq!(
            players.get("p2").and_then(|p| p.device_id.clone()),
            Some(DeviceId::new("mock_2"))
        );
    }

    #[test]
    fn test_unassign_unknown_player_is_none() {
        let mut players = PlayerTable::new();
        assert!(players.unassign("ghost").is_none());
    }

    #[test]
    fn test_list_players_is_sorted() {
        let mut players = PlayerTable::new();
        players.create("b", None);
        players.create("a", None);

        let ids: Vec<String> = players.list().into_iter().map(|p| p.player_id).collect();

        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_clear_single_slot_keeps_other_slots() {
        // Arrange
        let mut games = GameMappingTable::new();
        games.set("cs2", 1, DeviceId::new("mock_1"));
        games.set("cs2", 2, DeviceId::new("mock_2"));

        // Act
        let cleared = games.clear("cs2", Some(1));

        // Assert
        assert!(cleared);
        assert_eq!(games.get("cs2", 1), None);
        assert_eq!(games.get("cs2", 2), Some(&DeviceId::new("mock_2")));
    }

    #[test]
    fn test_emptied_game_disappears() {
        let mut games = GameMappingTable::new();
        games.set("cs2", 1, DeviceId::new("mock_1"));

        games.clear("cs2", Some(1));

        assert!(games.list(Some("cs2")).is_empty());
        assert!(!games.clear("cs2", None));
    }

    #[test]
    fn test_clear_whole_game() {
        let mut games = GameMappingTable::new();
        games.set("cs2", 1, DeviceId::new("mock_1"));
        games.set("cs2", 2, DeviceId::new("mock_2"));
        games.set("rl", 1, DeviceId::new("mock_3"));

        assert!(games.clear("cs2", None));

        assert_eq!(games.list(None).len(), 1);
        assert_eq!(games.list(None)[0].game_id, "rl");
    }

    #[test]
    fn test_list_filters_by_game() {
        let mut games = GameMappingTable::new();
        games.set("cs2", 2, DeviceId::new("mock_2"));
        games.set("cs2", 1, DeviceId::new("mock_1"));
        games.set("rl", 1, DeviceId::new("mock_3"));

        let cs2 = games.list(Some("cs2"));

        assert_eq!(cs2.len(), 2);
        assert_eq!(cs2[0].player_num, 1);
        assert_eq!(cs2[1].player_num, 2);
    }
}
