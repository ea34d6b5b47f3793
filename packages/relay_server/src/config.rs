use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::HubConfig;

// Two equivalent ways to configure:
//
//   relay.toml:      [relay]
//                    random_interval_ms = 250
//
//   env var:         SERIAL_RELAY_RELAY__RANDOM_INTERVAL_MS=250   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub relay: HubFileConfig,
}

/// Listener settings (lives under `[server]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of static UI files served at `/`
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: None,
        }
    }
}

/// Relay tunables (lives under `[relay]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    /// Cap on remembered broadcast bodies; unset keeps them all
    #[serde(default)]
    pub history_capacity: Option<usize>,
    #[serde(default = "default_random_interval_ms")]
    pub random_interval_ms: u64,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            history_capacity: None,
            random_interval_ms: default_random_interval_ms(),
        }
    }
}

impl HubFileConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            history_capacity: self.history_capacity,
            // a zero period would make tokio's interval panic
            random_interval: Duration::from_millis(self.random_interval_ms.max(1)),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_random_interval_ms() -> u64 {
    1000
}

/// Build a figment that layers: defaults → relay.toml → SERIAL_RELAY_* env vars.
///
///   `SERIAL_RELAY_SERVER__PORT=8080`  →  `server.port = 8080`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(RelayFileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("SERIAL_RELAY_").split("__"))
}
