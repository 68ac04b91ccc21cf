use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::constants::{
    CRATE_SIZE, SPAWN_ATTEMPTS_PER_CRATE, SPAWN_MAX_X, SPAWN_MAX_Y, SPAWN_MIN_X, SPAWN_MIN_Y,
};
use crate::crate_store::CrateStore;
use crate::types::{Crate, DeliveryZone};

pub fn crate_id(index: usize) -> String {
    format!("crate_{index}")
}

fn overlaps(a: &Crate, x: i32, y: i32) -> bool {
    a.x < x + CRATE_SIZE && x < a.x + CRATE_SIZE && a.y < y + CRATE_SIZE && y < a.y + CRATE_SIZE
}

/// Places `count` crates on the floor inside the spawn bounds, away from each
/// other and from the delivery zone. When the area is too crowded to find a
/// free spot the last candidate is used anyway.
pub fn spawn_crates<R: Rng + ?Sized>(count: usize, zone: &DeliveryZone, rng: &mut R) -> Vec<Crate> {
    let mut crates: Vec<Crate> = Vec::with_capacity(count);
    for index in 0..count {
        let mut candidate = (SPAWN_MIN_X, SPAWN_MIN_Y);
        for _ in 0..SPAWN_ATTEMPTS_PER_CRATE {
            candidate = (
                rng.random_range(SPAWN_MIN_X..=SPAWN_MAX_X),
                rng.random_range(SPAWN_MIN_Y..=SPAWN_MAX_Y),
            );
            let (x, y) = candidate;
            if zone.intersects_rect(x, y, CRATE_SIZE, CRATE_SIZE) {
                continue;
            }
            if crates.iter().any(|placed| overlaps(placed, x, y)) {
                continue;
            }
            break;
        }
        crates.push(Crate::on_floor(crate_id(index), candidate.0, candidate.1));
    }
    crates
}

/// Fills the store with a fresh crate set unless it already holds crates from
/// an earlier run. `reset` always starts over. Returns whether crates were
/// spawned.
pub fn seed_store(
    store: &dyn CrateStore,
    count: usize,
    zone: &DeliveryZone,
    seed: Option<u64>,
    reset: bool,
) -> bool {
    if !reset && !store.is_empty() {
        info!(crates = store.len(), "keeping crates from previous run");
        return false;
    }
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    store.replace_all(spawn_crates(count, zone, &mut rng));
    info!(crates = count, "spawned crates");
    true
}
