//! Application configuration.
//!
//! Loaded in layers: compiled defaults, then a TOML file, then
//! `LITEPROXY_*` environment variables. Validated at load time so a bad
//! deployment fails on startup instead of serving garbage.
//!
//! ```toml
//! listen_addr = "0.0.0.0:3333"
//! only_proxy = false
//!
//! [backend]
//! addrs = ["10.0.0.5:3333"]
//!
//! [[clients]]
//! name = "t1"
//! private_key = "9f0e…64 hex chars…ab12"
//! capacity_per_key = 500
//! capacity_per_ip = 100
//! cooling_per_sec = 50
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;

/// One preconfigured server identity with its tenant limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Logical tenant name, used as the `key` metric label.
    pub name: String,

    /// Hex-encoded 32-byte ed25519 seed.
    pub private_key: String,

    /// Leaky-bucket capacity shared by everyone behind this key.
    /// Zero disables the per-key limiter.
    #[serde(default)]
    pub capacity_per_key: u32,

    /// Leaky-bucket capacity per remote IP. Zero disables the per-IP
    /// limiter.
    #[serde(default)]
    pub capacity_per_ip: u32,

    /// Tokens leaked per second by each of this key's buckets.
    #[serde(default)]
    pub cooling_per_sec: u32,
}

impl ClientConfig {
    pub fn private_key_bytes(&self) -> anyhow::Result<[u8; 32]> {
        let bytes = hex::decode(self.private_key.trim())?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("private key of '{}' must be 32 bytes", self.name))?;
        Ok(seed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Upstream node addresses, tried round-robin.
    #[serde(default)]
    pub addrs: Vec<String>,

    /// Hex-encoded key id expected by the upstream transport, if it
    /// multiplexes identities.
    #[serde(default)]
    pub server_key_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_masters_capacity")]
    pub masters_capacity: usize,
    #[serde(default = "default_blocks_capacity")]
    pub blocks_capacity: usize,
    #[serde(default = "default_accounts_capacity")]
    pub accounts_capacity: usize,
    #[serde(default = "default_transactions_capacity")]
    pub transactions_capacity: usize,
    #[serde(default = "default_libraries_capacity")]
    pub libraries_capacity: usize,
    /// Seconds a master block is pinned against eviction.
    #[serde(default = "default_master_retention_secs")]
    pub master_retention_secs: u64,
    /// Tip poll cadence in milliseconds.
    #[serde(default = "default_tip_poll_interval_ms")]
    pub tip_poll_interval_ms: u64,
}

fn default_masters_capacity() -> usize {
    64
}

fn default_blocks_capacity() -> usize {
    2048
}

fn default_accounts_capacity() -> usize {
    8192
}

fn default_transactions_capacity() -> usize {
    8192
}

fn default_libraries_capacity() -> usize {
    4096
}

fn default_master_retention_secs() -> u64 {
    60
}

fn default_tip_poll_interval_ms() -> u64 {
    1000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            masters_capacity: default_masters_capacity(),
            blocks_capacity: default_blocks_capacity(),
            accounts_capacity: default_accounts_capacity(),
            transactions_capacity: default_transactions_capacity(),
            libraries_capacity: default_libraries_capacity(),
            master_retention_secs: default_master_retention_secs(),
            tip_poll_interval_ms: default_tip_poll_interval_ms(),
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            masters_capacity: self.masters_capacity,
            blocks_capacity: self.blocks_capacity,
            accounts_capacity: self.accounts_capacity,
            transactions_capacity: self.transactions_capacity,
            libraries_capacity: self.libraries_capacity,
            master_retention: Duration::from_secs(self.master_retention_secs),
            tip_poll_interval: Duration::from_millis(self.tip_poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: String,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: default_metrics_enabled(), listen_addr: default_metrics_listen_addr() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `"pretty"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Client-facing listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Route every query straight to the backend, bypassing caching and
    /// emulation entirely.
    #[serde(default)]
    pub only_proxy: bool,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3333".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { addrs: Vec::new(), server_key_id: None }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            only_proxy: false,
            backend: BackendConfig::default(),
            cache: CacheSettings::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            clients: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from an optional file plus `LITEPROXY_*`
    /// environment overrides (`LITEPROXY_BACKEND__ADDRS`, ...).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: Self = builder
            .add_source(Environment::with_prefix("LITEPROXY").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients.is_empty() {
            return Err(ConfigError::Message("at least one client key is required".into()));
        }
        for client in &self.clients {
            if client.name.is_empty() {
                return Err(ConfigError::Message("client name cannot be empty".into()));
            }
            if client.private_key_bytes().is_err() {
                return Err(ConfigError::Message(format!(
                    "client '{}' carries an invalid private key seed",
                    client.name
                )));
            }
            if (client.capacity_per_key > 0 || client.capacity_per_ip > 0)
                && client.cooling_per_sec == 0
            {
                return Err(ConfigError::Message(format!(
                    "client '{}' enables a limiter with zero cooling rate",
                    client.name
                )));
            }
        }
        if self.cache.masters_capacity == 0 || self.cache.tip_poll_interval_ms == 0 {
            return Err(ConfigError::Message("cache sizing must be non-zero".into()));
        }
        Ok(())
    }
}
