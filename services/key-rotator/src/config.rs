//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The Redis connection string is read from the REDIS_URL env var or from
//! `store.url_file`, never from the TOML directly, since it usually carries
//! a password.

use chrono::{DateTime, Utc};
use common::Secret;
use key_pool::{KeyRecord, RateLimits};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Keys and the limits applied to each of them
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub per_minute: u64,
    #[serde(default)]
    pub per_hour: u64,
    #[serde(default)]
    pub per_day: u64,
    #[serde(default)]
    pub per_month: u64,
    /// Seconds between scheduled rotations; 0 disables them
    #[serde(default)]
    pub rotate_interval_secs: u64,
    pub keys: Vec<KeyConfig>,
}

/// One configured credential
#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    pub id: String,
    /// RFC 3339 instant; absent means the key never expires
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Which queue backing holds the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

/// Shared store settings
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(skip)]
    pub url: Option<Secret<String>>,
    /// Path to a file containing the Redis URL (alternative to REDIS_URL)
    #[serde(default)]
    pub url_file: Option<PathBuf>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: None,
            url_file: None,
            namespace: default_namespace(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_namespace() -> String {
    "key-pool".to_string()
}

impl PoolConfig {
    pub fn limits(&self) -> RateLimits {
        RateLimits {
            per_minute: self.per_minute,
            per_hour: self.per_hour,
            per_day: self.per_day,
            per_month: self.per_month,
        }
    }

    /// Fresh records for every configured key, in configuration order.
    pub fn records(&self) -> Vec<KeyRecord> {
        let limits = self.limits();
        self.keys
            .iter()
            .map(|key| {
                let record = KeyRecord::new(key.id.clone(), limits);
                match key.expires_at {
                    Some(at) => record.with_expiration(at),
                    None => record,
                }
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Redis URL resolution order:
    /// 1. REDIS_URL env var
    /// 2. url_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.keys.is_empty() {
            return Err(common::Error::Config(
                "pool.keys must list at least one key".into(),
            ));
        }

        if config.pool.keys.iter().any(|k| k.id.trim().is_empty()) {
            return Err(common::Error::Config(
                "pool.keys entries must have a non-empty id".into(),
            ));
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.store.url = Some(Secret::new(url));
        } else if let Some(ref url_file) = config.store.url_file {
            let url = std::fs::read_to_string(url_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read url_file {}: {e}",
                    url_file.display()
                ))
            })?;
            let url = url.trim().to_owned();
            if !url.is_empty() {
                config.store.url = Some(Secret::new(url));
            }
        }

        if config.store.backend == Backend::Redis && config.store.url.is_none() {
            return Err(common::Error::Config(
                "redis backend requires REDIS_URL or store.url_file".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("key-rotator.toml")
    }
}
