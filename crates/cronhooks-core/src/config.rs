use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8085;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Top-level config (cronhooks.toml + CRONHOOKS_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronhooksConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Local dispatch queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of webhook executions running at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How often the queue engine looks for due dispatches.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronhooks/cronhooks.db", home)
}

impl CronhooksConfig {
    /// Load config from a TOML file with CRONHOOKS_* env var overrides.
    ///
    /// Nested keys use a double underscore: `CRONHOOKS_QUEUE__WORKERS=8`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CRONHOOKS_").split("__")),
        )
    }

    /// Extract a config from any figment, layered over the built-in defaults.
    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        Figment::from(Serialized::defaults(CronhooksConfig::default()))
            .merge(figment)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronhooks/cronhooks.toml", home)
}
