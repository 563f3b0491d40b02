//! Background process configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) yields a working configuration.
//!
//! ```toml
//! log_url = "https://proxy.brume.money"
//!
//! [tor]
//! proxies = ["127.0.0.1:9050", "127.0.0.1:9150"]
//!
//! [pools]
//! brumes_per_wallet = 3
//!
//! [timeouts]
//! send_transaction_secs = 600
//!
//! [endpoints]
//! 1 = ["https://rpc.example.org"]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::*;
use crate::looped::RetrySettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub tor: TorConfig,
    pub pools: PoolsConfig,
    pub retry: RetryConfig,
    pub popup: PopupConfig,
    pub timeouts: TimeoutsConfig,
    pub storage: StorageConfig,
    /// Where `brume_log` posts its beacon.
    pub log_url: String,
    /// RPC endpoints by chain id, replacing the built-in ones.
    pub endpoints: BTreeMap<String, Vec<String>>,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            tor: TorConfig::default(),
            pools: PoolsConfig::default(),
            retry: RetryConfig::default(),
            popup: PopupConfig::default(),
            timeouts: TimeoutsConfig::default(),
            storage: StorageConfig::default(),
            log_url: LOG_URL.to_string(),
            endpoints: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    /// SOCKS5 endpoints tried when building a client connection.
    pub proxies: Vec<String>,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self { proxies: vec![DEFAULT_TOR_PROXY.to_string()] }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub tors: usize,
    pub circuits: usize,
    pub brumes: usize,
    pub brumes_per_wallet: usize,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            tors: TOR_POOL_CAPACITY,
            circuits: CIRCUIT_POOL_CAPACITY,
            brumes: BRUME_POOL_CAPACITY,
            brumes_per_wallet: BRUMES_PER_WALLET,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_delay_ms: RETRY_BASE_DELAY.as_millis() as u64,
            max_delay_ms: RETRY_MAX_DELAY.as_millis() as u64,
        }
    }
}

impl From<&RetryConfig> for RetrySettings {
    fn from(config: &RetryConfig) -> Self {
        RetrySettings {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopupConfig {
    pub width: u32,
    pub height: u32,
    /// A new window that stays silent this long is given up on.
    pub hello_timeout_secs: u64,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self { width: POPUP_WIDTH, height: POPUP_HEIGHT, hello_timeout_secs: POPUP_HELLO_TIMEOUT.as_secs() }
    }
}

impl PopupConfig {
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_secs(self.hello_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub send_transaction_secs: u64,
    pub fetch_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            send_transaction_secs: SEND_TRANSACTION_TIMEOUT.as_secs(),
            fetch_secs: FETCH_TIMEOUT.as_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn send_transaction(&self) -> Duration {
        Duration::from_secs(self.send_transaction_secs)
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// PBKDF2 rounds for newly created users.
    pub kdf_iterations: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let path = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("brume")
            .join("background.db");
        Self { path, kdf_iterations: KDF_ITERATIONS }
    }
}

impl BackgroundConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings::from(&self.retry)
    }

    /// Endpoint overrides keyed by numeric chain id. Non-numeric keys are skipped.
    pub fn endpoint_overrides(&self) -> HashMap<u64, Vec<String>> {
        self.endpoints
            .iter()
            .filter(|(_, urls)| !urls.is_empty())
            .filter_map(|(id, urls)| id.parse().ok().map(|id| (id, urls.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BackgroundConfig::from_toml("").unwrap();
        assert_eq!(config.tor.proxies, vec![DEFAULT_TOR_PROXY.to_string()]);
        assert_eq!(config.pools.brumes_per_wallet, 3);
        assert_eq!(config.popup.height, 630);
        assert_eq!(config.popup.hello_timeout(), POPUP_HELLO_TIMEOUT);
        assert_eq!(config.timeouts.send_transaction(), Duration::from_secs(600));
        assert_eq!(config.log_url, LOG_URL);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = BackgroundConfig::from_toml(
            r#"
            [tor]
            proxies = ["127.0.0.1:9150"]

            [pools]
            circuits = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.tor.proxies, vec!["127.0.0.1:9150".to_string()]);
        assert_eq!(config.pools.circuits, 4);
        assert_eq!(config.pools.tors, TOR_POOL_CAPACITY);
        assert_eq!(config.retry.max_attempts, RETRY_MAX_ATTEMPTS);
    }

    #[test]
    fn test_endpoint_overrides() {
        let config = BackgroundConfig::from_toml(
            r#"
            [endpoints]
            1 = ["http://127.0.0.1:8545"]
            mainnet = ["http://ignored"]
            137 = []
            "#,
        )
        .unwrap();
        let overrides = config.endpoint_overrides();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[&1], vec!["http://127.0.0.1:8545".to_string()]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brume.toml");
        std::fs::write(&path, "[retry]\nmax_attempts = 5\n").unwrap();
        let config = BackgroundConfig::load(&path).unwrap();
        assert_eq!(config.retry_settings().max_attempts, 5);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = BackgroundConfig::load(Path::new("/nonexistent/brume.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
