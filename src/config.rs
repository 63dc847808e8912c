//! TOML configuration.
//!
//! The defaults are embedded in the binary; a user file is merged over them
//! key by key, so it only needs to carry what it changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default configuration embedded at compile time from `config/default.toml`.
const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "SPOOLKEEPER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub data_dir: String,
    pub printer: PrinterConfig,
    pub backoff: BackoffConfig,
    pub tracking: TrackingConfig,
    pub inventory: InventoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    pub url: String,
    pub poll_interval_sec: u64,
    pub history_interval_sec: u64,
    pub history_limit: usize,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub full_roll_weight_g: f64,
    pub filament_diameter_mm: f64,
    pub auto_attribute: bool,
    pub densities: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub cache_ttl_sec: u64,
    pub tag_field: String,
}

impl PrinterConfig {
    pub fn enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// Poll interval, never below one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec.max(1))
    }

    pub fn history_interval(&self) -> Duration {
        Duration::from_secs(self.history_interval_sec.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

impl InventoryConfig {
    pub fn enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_sec)
    }
}

impl AppConfig {
    /// Load config from `path` merged over the embedded defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Load the config named by `SPOOLKEEPER_CONFIG`, or the defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(Path::new(path.trim())),
            _ => {
                debug!("{} not set, using embedded defaults", CONFIG_ENV);
                Ok(default_config())
            }
        }
    }

    /// Parse a (possibly partial) TOML document over the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut base: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
        let overlay: toml::Table = toml::from_str(content)?;
        merge_tables(&mut base, overlay);
        let config: AppConfig = toml::Value::Table(base).try_into()?;
        Ok(config)
    }

    /// Directory for `state.json`: configured path, or `<data dir>/spoolkeeper`.
    pub fn data_dir(&self) -> PathBuf {
        if !self.data_dir.trim().is_empty() {
            return PathBuf::from(self.data_dir.trim());
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("spoolkeeper")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }
}

/// The embedded defaults.
///
/// # Panics
/// Panics if the embedded TOML is invalid (a build-time bug, covered by tests).
pub fn default_config() -> AppConfig {
    toml::from_str(DEFAULT_CONFIG).expect("embedded default.toml must be valid")
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => {
                if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                    merge_tables(existing, incoming);
                    continue;
                }
                base.insert(key, toml::Value::Table(incoming));
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}
