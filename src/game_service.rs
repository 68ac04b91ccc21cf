//! Crate lifecycle rules: pick up, deliver, collect, and position updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::constants::DELIVERY_REWARD;
use crate::crate_store::CrateStore;
use crate::error::{ConflictReason, GameError, GameResult};
use crate::player_registry::PlayerRegistry;
use crate::types::{Crate, CrateState, DeliveryZone, PositionView, Snapshot};

/// One async mutex per crate id so multi-step transitions on the same crate
/// never interleave, while different crates proceed independently. An entry
/// only lives while some request holds or waits on it.
#[derive(Debug, Default)]
struct CrateLocks {
    locks: Mutex<HashMap<String, LockEntry>>,
}

#[derive(Debug)]
struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

struct CrateLockGuard<'a> {
    locks: &'a CrateLocks,
    crate_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CrateLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.table();
        let idle = match locks.get_mut(&self.crate_id) {
            Some(entry) => {
                entry.users = entry.users.saturating_sub(1);
                entry.users == 0
            }
            None => false,
        };
        if idle {
            locks.remove(&self.crate_id);
        }
    }
}

impl CrateLocks {
    fn table(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The returned guard is registered before waiting, so a request dropped
    /// mid-wait still releases its slot.
    async fn acquire(&self, crate_id: &str) -> CrateLockGuard<'_> {
        let mutex = {
            let mut locks = self.table();
            let entry = locks
                .entry(crate_id.to_string())
                .or_insert_with(|| LockEntry {
                    mutex: Arc::new(AsyncMutex::new(())),
                    users: 0,
                });
            entry.users += 1;
            entry.mutex.clone()
        };
        let mut guard = CrateLockGuard {
            locks: self,
            crate_id: crate_id.to_string(),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.table().len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectOutcome {
    PickedUp(Crate),
    Delivered { score: i64 },
}

pub struct GameService {
    store: Arc<dyn CrateStore>,
    players: Arc<PlayerRegistry>,
    zone: DeliveryZone,
    reward: i64,
    crate_locks: CrateLocks,
}

impl GameService {
    pub fn new(store: Arc<dyn CrateStore>, players: Arc<PlayerRegistry>, zone: DeliveryZone) -> Self {
        Self {
            store,
            players,
            zone,
            reward: DELIVERY_REWARD,
            crate_locks: CrateLocks::default(),
        }
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.players
    }

    pub fn crates(&self) -> Vec<Crate> {
        self.store.list()
    }

    pub fn update_position(&self, player_id: &str, x: i32, y: i32) {
        self.players.upsert_position(player_id, x, y);
    }

    pub async fn pick_up(&self, player_id: &str, crate_id: &str) -> GameResult<Crate> {
        let _guard = self.crate_locks.acquire(crate_id).await;
        self.pick_up_locked(player_id, crate_id)
    }

    /// Returns the player's score after the delivery.
    pub async fn deliver(&self, player_id: &str, crate_id: &str) -> GameResult<i64> {
        let _guard = self.crate_locks.acquire(crate_id).await;
        let krate = self.store.get(crate_id)?;
        self.deliver_locked(player_id, &krate)
    }

    /// Picks the crate up when it lies on the floor, otherwise tries to
    /// deliver it.
    pub async fn collect(&self, player_id: &str, crate_id: &str) -> GameResult<CollectOutcome> {
        let _guard = self.crate_locks.acquire(crate_id).await;
        let krate = self.store.get(crate_id)?;
        match krate.state {
            CrateState::OnFloor => self
                .pick_up_locked(player_id, crate_id)
                .map(CollectOutcome::PickedUp),
            CrateState::Carried { .. } => self
                .deliver_locked(player_id, &krate)
                .map(|score| CollectOutcome::Delivered { score }),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let crates = self.store.list();
        let registry = self.players.snapshot();
        Snapshot {
            crates,
            scores: registry.scores,
            positions: registry.positions,
        }
    }

    fn pick_up_locked(&self, player_id: &str, crate_id: &str) -> GameResult<Crate> {
        match self.store.set_state(crate_id, CrateState::carried_by(player_id)) {
            Ok(krate) => {
                info!(player_id, crate_id, "crate picked up");
                Ok(krate)
            }
            Err(error) => {
                debug!(player_id, crate_id, %error, "pick up rejected");
                Err(error)
            }
        }
    }

    fn deliver_locked(&self, player_id: &str, krate: &Crate) -> GameResult<i64> {
        let crate_id = krate.id.as_str();
        if let Err(reason) = self.check_delivery(player_id, krate) {
            debug!(player_id, crate_id, %reason, "delivery rejected");
            return Err(GameError::Conflict(reason));
        }

        self.store.remove(crate_id)?;
        let score = self.players.add_score(player_id, self.reward);
        info!(player_id, crate_id, score, "crate delivered");
        Ok(score)
    }

    fn check_delivery(&self, player_id: &str, krate: &Crate) -> Result<(), ConflictReason> {
        match krate.state.carrier_id() {
            None => return Err(ConflictReason::NotCarried),
            Some(carrier) if carrier != player_id => return Err(ConflictReason::NotYourCrate),
            Some(_) => {}
        }
        // Players that never reported a position stand at the origin.
        let position = self
            .players
            .position(player_id)
            .unwrap_or(PositionView { x: 0, y: 0 });
        if !self.zone.contains(position.x, position.y) {
            return Err(ConflictReason::OutsideDeliveryZone);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_DELIVERY_ZONE;
    use crate::crate_store::MemoryCrateStore;

    fn make_service(crates: Vec<Crate>) -> GameService {
        GameService::new(
            Arc::new(MemoryCrateStore::new(crates)),
            Arc::new(PlayerRegistry::new()),
            DEFAULT_DELIVERY_ZONE,
        )
    }

    fn single_crate_service() -> GameService {
        make_service(vec![Crate::on_floor("c0", 100, 100)])
    }

    fn assert_carrier_invariant(snapshot: &Snapshot) {
        for krate in &snapshot.crates {
            let value = serde_json::to_value(krate).expect("serialize crate");
            assert_eq!(value["state"] == "carried", !value["carrierId"].is_null());
        }
    }

    #[tokio::test]
    async fn pick_up_then_deliver_inside_zone_scores() {
        let service = single_crate_service();
        service.update_position("p1", 100, 100);

        let carried = service.pick_up("p1", "c0").await.expect("pick up succeeds");
        assert_eq!(carried.state.carrier_id(), Some("p1"));
        assert_eq!(service.players().score("p1"), 0);

        service.update_position("p1", 450, 520);
        let score = service.deliver("p1", "c0").await.expect("deliver succeeds");
        assert_eq!(score, 10);

        let snapshot = service.snapshot();
        assert!(snapshot.crates.iter().all(|krate| krate.id != "c0"));
        assert_eq!(snapshot.scores.get("p1"), Some(&10));
        assert_carrier_invariant(&snapshot);
    }

    #[tokio::test]
    async fn second_pick_up_conflicts() {
        let service = single_crate_service();
        service.pick_up("p1", "c0").await.expect("pick up succeeds");
        assert_eq!(
            service.pick_up("p2", "c0").await,
            Err(GameError::Conflict(ConflictReason::AlreadyCarried))
        );
        assert_eq!(
            service.pick_up("p1", "c0").await,
            Err(GameError::Conflict(ConflictReason::AlreadyCarried))
        );
    }

    #[tokio::test]
    async fn deliver_outside_zone_keeps_crate_carried() {
        let service = single_crate_service();
        service.pick_up("p1", "c0").await.expect("pick up succeeds");
        service.update_position("p1", 0, 0);

        assert_eq!(
            service.deliver("p1", "c0").await,
            Err(GameError::Conflict(ConflictReason::OutsideDeliveryZone))
        );
        let crates = service.crates();
        assert_eq!(crates[0].state, CrateState::carried_by("p1"));
        assert_eq!(service.players().score("p1"), 0);
    }

    #[tokio::test]
    async fn deliver_without_reported_position_is_outside_zone() {
        let service = single_crate_service();
        service.pick_up("p1", "c0").await.expect("pick up succeeds");
        assert_eq!(
            service.deliver("p1", "c0").await,
            Err(GameError::Conflict(ConflictReason::OutsideDeliveryZone))
        );
    }

    #[tokio::test]
    async fn deliver_distinguishes_rejection_reasons() {
        let service = make_service(vec![
            Crate::on_floor("c0", 100, 100),
            Crate::on_floor("c1", 200, 200),
        ]);
        service.update_position("p1", 450, 520);
        service.update_position("p2", 450, 520);

        assert_eq!(
            service.deliver("p1", "c0").await,
            Err(GameError::Conflict(ConflictReason::NotCarried))
        );
        service.pick_up("p1", "c1").await.expect("pick up succeeds");
        assert_eq!(
            service.deliver("p2", "c1").await,
            Err(GameError::Conflict(ConflictReason::NotYourCrate))
        );
        assert_eq!(
            service.deliver("p1", "missing").await,
            Err(GameError::NotFound("missing".to_string()))
        );
        assert_eq!(service.players().score("p2"), 0);
    }

    #[tokio::test]
    async fn delivered_crate_is_gone_for_good() {
        let service = single_crate_service();
        service.pick_up("p1", "c0").await.expect("pick up succeeds");
        service.update_position("p1", 400, 500);
        service.deliver("p1", "c0").await.expect("deliver succeeds");

        assert_eq!(
            service.pick_up("p2", "c0").await,
            Err(GameError::NotFound("c0".to_string()))
        );
        assert_eq!(
            service.deliver("p1", "c0").await,
            Err(GameError::NotFound("c0".to_string()))
        );
        assert_eq!(service.players().score("p1"), 10);
        assert!(service.snapshot().crates.is_empty());
    }

    #[tokio::test]
    async fn player_may_carry_several_crates() {
        let service = make_service(vec![
            Crate::on_floor("c0", 100, 100),
            Crate::on_floor("c1", 200, 200),
        ]);
        service.pick_up("p1", "c0").await.expect("first pick up");
        service.pick_up("p1", "c1").await.expect("second pick up");
        service.update_position("p1", 450, 520);
        service.deliver("p1", "c0").await.expect("first deliver");
        let score = service.deliver("p1", "c1").await.expect("second deliver");
        assert_eq!(score, 20);
    }

    #[tokio::test]
    async fn collect_toggles_between_pick_up_and_deliver() {
        let service = single_crate_service();
        let outcome = service.collect("p1", "c0").await.expect("collect picks up");
        assert!(matches!(outcome, CollectOutcome::PickedUp(_)));

        assert_eq!(
            service.collect("p2", "c0").await,
            Err(GameError::Conflict(ConflictReason::NotYourCrate))
        );
        assert_eq!(
            service.collect("p1", "c0").await,
            Err(GameError::Conflict(ConflictReason::OutsideDeliveryZone))
        );

        service.update_position("p1", 450, 520);
        assert_eq!(
            service.collect("p1", "c0").await,
            Ok(CollectOutcome::Delivered { score: 10 })
        );
        assert!(service.crates().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pick_ups_have_one_winner() {
        for _ in 0..20 {
            let service = Arc::new(single_crate_service());
            let handles: Vec<_> = (0..8)
                .map(|idx| {
                    let service = service.clone();
                    tokio::spawn(async move { service.pick_up(&format!("p{idx}"), "c0").await })
                })
                .collect();

            let mut wins = 0;
            let mut conflicts = 0;
            for handle in handles {
                match handle.await.expect("task finished") {
                    Ok(_) => wins += 1,
                    Err(error) => {
                        assert!(matches!(error, GameError::Conflict(_)));
                        conflicts += 1;
                    }
                }
            }
            assert_eq!(wins, 1);
            assert_eq!(conflicts, 7);
            assert_carrier_invariant(&service.snapshot());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_score_once() {
        let service = Arc::new(single_crate_service());
        service.pick_up("p1", "c0").await.expect("pick up succeeds");
        service.update_position("p1", 450, 520);

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.deliver("p1", "c0").await })
            })
            .collect();
        let mut successes = 0;
        for handle in handles {
            if handle.await.expect("task finished").is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(service.players().score("p1"), 10);
    }

    #[tokio::test]
    async fn unknown_crate_ids_leave_no_lock_entries() {
        let service = single_crate_service();
        for idx in 0..500 {
            let bogus = format!("bogus_{idx}");
            assert!(service.pick_up("p1", &bogus).await.is_err());
            assert!(service.deliver("p1", &bogus).await.is_err());
            assert!(service.collect("p1", &bogus).await.is_err());
        }
        assert!(service.pick_up("p2", "c0").await.is_ok());
        assert!(service.pick_up("p1", "c0").await.is_err());
        assert_eq!(service.crate_locks.tracked(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lock_entries_are_released_after_contention() {
        let service = Arc::new(make_service(vec![
            Crate::on_floor("c0", 100, 100),
            Crate::on_floor("c1", 200, 200),
        ]));
        let handles: Vec<_> = (0..32)
            .map(|idx| {
                let service = service.clone();
                tokio::spawn(async move {
                    let crate_id = if idx % 2 == 0 { "c0" } else { "c1" };
                    let _ = service.pick_up(&format!("p{idx}"), crate_id).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("task finished");
        }
        assert_eq!(service.crate_locks.tracked(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_lock_entry() {
        let locks = CrateLocks::default();
        let held = locks.acquire("c0").await;
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(10), locks.acquire("c0")).await;
        assert!(waited.is_err());
        assert_eq!(locks.tracked(), 1);
        drop(held);
        assert_eq!(locks.tracked(), 0);
    }
}
