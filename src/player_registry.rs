//! In-memory player positions and scores. Lives as long as the process;
//! nothing here is persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use crate::types::{PlayerState, PositionView};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub scores: BTreeMap<String, i64>,
    pub positions: BTreeMap<String, PositionView>,
}

#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: RwLock<HashMap<String, PlayerState>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PlayerState>> {
        self.players.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PlayerState>> {
        self.players.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last write wins.
    pub fn upsert_position(&self, player_id: &str, x: i32, y: i32) {
        let mut players = self.write();
        let player = players
            .entry(player_id.to_string())
            .or_insert_with(|| PlayerState::new(player_id));
        player.x = x;
        player.y = y;
    }

    /// Returns the new score.
    pub fn add_score(&self, player_id: &str, delta: i64) -> i64 {
        let mut players = self.write();
        let player = players
            .entry(player_id.to_string())
            .or_insert_with(|| PlayerState::new(player_id));
        player.score = player.score.saturating_add(delta);
        player.score
    }

    pub fn position(&self, player_id: &str) -> Option<PositionView> {
        self.read().get(player_id).map(|player| PositionView {
            x: player.x,
            y: player.y,
        })
    }

    pub fn score(&self, player_id: &str) -> i64 {
        self.read()
            .get(player_id)
            .map(|player| player.score)
            .unwrap_or(0)
    }

    pub fn get(&self, player_id: &str) -> Option<PlayerState> {
        self.read().get(player_id).cloned()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let players = self.read();
        let mut snapshot = RegistrySnapshot::default();
        for player in players.values() {
            snapshot.scores.insert(player.id.clone(), player.score);
            snapshot.positions.insert(
                player.id.clone(),
                PositionView {
                    x: player.x,
                    y: player.y,
                },
            );
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn position_is_last_write_wins() {
        let registry = PlayerRegistry::new();
        registry.upsert_position("p1", 1, 2);
        registry.upsert_position("p2", 9, 9);
        registry.upsert_position("p1", 3, 4);
        assert_eq!(registry.position("p1"), Some(PositionView { x: 3, y: 4 }));
        assert_eq!(registry.position("p2"), Some(PositionView { x: 9, y: 9 }));
        assert_eq!(registry.position("missing"), None);
    }

    #[test]
    fn add_score_creates_player_lazily() {
        let registry = PlayerRegistry::new();
        assert_eq!(registry.score("p1"), 0);
        assert_eq!(registry.add_score("p1", 10), 10);
        assert_eq!(registry.add_score("p1", 10), 20);
        let player = registry.get("p1").expect("player exists");
        assert_eq!((player.x, player.y, player.score), (0, 0, 20));
    }

    #[test]
    fn position_update_keeps_score() {
        let registry = PlayerRegistry::new();
        registry.add_score("p1", 10);
        registry.upsert_position("p1", 5, 6);
        assert_eq!(registry.score("p1"), 10);
    }

    #[test]
    fn snapshot_lists_every_player() {
        let registry = PlayerRegistry::new();
        registry.upsert_position("p1", 1, 1);
        registry.add_score("p2", 10);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.scores.get("p1"), Some(&0));
        assert_eq!(snapshot.scores.get("p2"), Some(&10));
        assert_eq!(snapshot.positions.get("p2"), Some(&PositionView { x: 0, y: 0 }));
    }

    #[test]
    fn concurrent_score_increments_are_not_lost() {
        let registry = Arc::new(PlayerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.add_score("p1", 10);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread finished");
        }
        assert_eq!(registry.score("p1"), 8_000);
    }
}
