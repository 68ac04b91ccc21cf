use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::constants::{DEFAULT_CRATE_COUNT, DEFAULT_DELIVERY_ZONE, TICK_MS};
use crate::types::DeliveryZone;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Authoritative crate courier game server")]
pub struct ServerConfig {
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// JSON file backing the crate store. Crates stay in memory when unset.
    #[arg(long, env = "CRATE_DB_PATH")]
    pub crate_db_path: Option<PathBuf>,

    #[arg(long, env = "CRATE_COUNT", default_value_t = DEFAULT_CRATE_COUNT)]
    pub crate_count: usize,

    #[arg(long, env = "TICK_MS", default_value_t = TICK_MS)]
    pub tick_ms: u64,

    #[arg(long, env = "CRATE_SEED")]
    pub seed: Option<u64>,

    /// Re-seed the crate store on startup even if it already holds crates.
    #[arg(long, env = "CRATE_RESET")]
    pub reset: bool,

    /// Delivery zone as x0,y0,x1,y1.
    #[arg(long, env = "DELIVERY_ZONE", default_value_t = DEFAULT_DELIVERY_ZONE)]
    pub zone: DeliveryZone,

    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn resolve_static_dir(&self) -> Option<PathBuf> {
        if let Some(path) = self.static_dir.as_ref() {
            if path.join("index.html").is_file() {
                return Some(path.clone());
            }
        }
        [PathBuf::from("client"), PathBuf::from("dist/client")]
            .into_iter()
            .find(|path| path.join("index.html").is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_game_constants() {
        let config = ServerConfig::try_parse_from(["server"]).expect("defaults parse");
        assert_eq!(config.crate_count, 10);
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.zone, DeliveryZone::new(400, 500, 500, 550));
        assert!(config.crate_db_path.is_none());
        assert!(!config.reset);
    }

    #[test]
    fn flags_override_defaults() {
        let config = ServerConfig::try_parse_from([
            "server",
            "--port",
            "9000",
            "--crate-count",
            "3",
            "--zone",
            "0,0,10,10",
            "--crate-db-path",
            "/tmp/crates.json",
            "--reset",
        ])
        .expect("flags parse");
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.crate_count, 3);
        assert_eq!(config.zone, DeliveryZone::new(0, 0, 10, 10));
        assert_eq!(config.crate_db_path, Some(PathBuf::from("/tmp/crates.json")));
        assert!(config.reset);
    }

    #[test]
    fn malformed_zone_is_rejected() {
        assert!(ServerConfig::try_parse_from(["server", "--zone", "1,2"]).is_err());
    }
}
