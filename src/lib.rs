pub mod broadcast;
pub mod config;
pub mod constants;
pub mod crate_store;
pub mod error;
pub mod game_service;
pub mod gateway;
pub mod player_registry;
pub mod spawn;
pub mod types;
