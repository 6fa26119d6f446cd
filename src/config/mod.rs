use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub crypto: CryptoConfig,
    pub queue: QueueConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub auth_url: String,
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Token encryption keys, hex-encoded 32-byte values keyed by key id.
/// `active_key_id` names the key used to seal newly issued tokens; stored
/// tokens record which key they were sealed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    pub active_key_id: String,
    pub keys: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub cron_poll_interval_ms: u64,
    pub concurrency: usize,
    pub keep_completed: i64,
    pub keep_failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minutes between periodic scheduler ticks; also the claim horizon
    pub interval_minutes: i64,
    /// Maximum accounts claimed per tick
    pub batch_size: i64,
    /// Lookback for accounts that have synced before but carry no usable
    /// last-synced timestamp
    pub default_lookback_days: i64,
    /// Hard cap on the sync window after long outages
    pub max_lookback_days: i64,
    /// Fixed lookback for the initial historical sync of a new account
    pub initial_lookback_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/banksync".to_string(),
                max_connections: Some(10),
            },
            provider: ProviderConfig {
                auth_url: "https://auth.truelayer.com".to_string(),
                api_url: "https://api.truelayer.com".to_string(),
                client_id: String::new(),
                client_secret: String::new(),
                redirect_uri: "http://localhost:8080/callback".to_string(),
            },
            crypto: CryptoConfig {
                active_key_id: "primary".to_string(),
                keys: HashMap::new(),
            },
            queue: QueueConfig {
                poll_interval_ms: 500,
                cron_poll_interval_ms: 15_000,
                concurrency: 4,
                keep_completed: 1000,
                keep_failed: 5000,
            },
            sync: SyncConfig {
                interval_minutes: 5,
                batch_size: 100,
                default_lookback_days: 7,
                max_lookback_days: 90,
                initial_lookback_days: 90,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            Ok(default_config)
        }
    }
}
