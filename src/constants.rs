use crate::types::DeliveryZone;

pub const TICK_MS: u64 = 1_000;

pub const DELIVERY_REWARD: i64 = 10;
pub const DEFAULT_CRATE_COUNT: usize = 10;

pub const CRATE_SIZE: i32 = 20;
pub const SPAWN_MIN_X: i32 = 50;
pub const SPAWN_MAX_X: i32 = 900;
pub const SPAWN_MIN_Y: i32 = 50;
pub const SPAWN_MAX_Y: i32 = 500;
pub const SPAWN_ATTEMPTS_PER_CRATE: usize = 64;

pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

pub const DEFAULT_DELIVERY_ZONE: DeliveryZone = DeliveryZone {
    x0: 400,
    y0: 500,
    x1: 500,
    y1: 550,
};
