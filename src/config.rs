use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::intercept::OfflineKind;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub cache: CacheConfig,
  pub compute: ComputeConfig,
  pub sync: SyncSettings,
  pub network: NetworkConfig,
  pub logging: LoggingConfig,
  /// Localized offline messages, keyed by request type
  pub messages: MessagesConfig,
  /// Where the databases and logs live (default: $XDG_DATA_HOME/offsync)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Origin of the application, e.g. "https://app.example.com"
  pub origin: String,
  /// Path prefix of the generic API
  pub api_prefix: String,
  /// Path prefixes served stale-while-revalidate
  pub user_data_prefixes: Vec<String>,
  /// Paths cached when the interception layer installs
  pub precache: Vec<String>,
  /// Path probed to confirm connectivity
  pub probe_path: String,
  /// Activate a newly installed interception layer without waiting
  pub skip_waiting: bool,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      api_prefix: "/api/".to_string(),
      user_data_prefixes: vec!["/api/user/".to_string(), "/api/profile/".to_string()],
      precache: vec!["/".to_string(), "/index.html".to_string()],
      probe_path: "/favicon.ico".to_string(),
      skip_waiting: true,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Persist entries in SQLite under the data directory
  #[default]
  Sqlite,
  /// Keep entries in memory for the life of the process
  Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub backend: StorageBackend,
  pub static_ttl_secs: u64,
  pub api_ttl_secs: u64,
  pub user_data_ttl_secs: u64,
  pub general_ttl_secs: u64,
  /// Eager sweep period; 0 disables the sweeper
  pub sweep_interval_secs: u64,
  pub timeout_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      backend: StorageBackend::Sqlite,
      static_ttl_secs: 7 * 24 * 60 * 60,
      api_ttl_secs: 24 * 60 * 60,
      user_data_ttl_secs: 24 * 60 * 60,
      general_ttl_secs: 24 * 60 * 60,
      sweep_interval_secs: 10 * 60,
      timeout_ms: 5_000,
    }
  }
}

impl CacheConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
  pub timeout_ms: u64,
}

impl Default for ComputeConfig {
  fn default() -> Self {
    Self { timeout_ms: 30_000 }
  }
}

impl ComputeConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub max_retries: u32,
  pub batch_size: usize,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      base_delay_ms: 1_000,
      max_delay_ms: 60_000,
      max_retries: 5,
      batch_size: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Quiet period after an online signal before declaring recovery
  pub stabilization_ms: u64,
  pub probe_timeout_ms: u64,
  /// Active probe period for `watch`; 0 disables polling
  pub probe_interval_ms: u64,
  /// Confirm online signals with an active probe
  pub confirm_with_probe: bool,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      stabilization_ms: 500,
      probe_timeout_ms: 5_000,
      probe_interval_ms: 30_000,
      confirm_with_probe: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Write logs to files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
  pub offline: BTreeMap<OfflineKind, String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// Without a file the defaults are used. `OFFSYNC_SERVER_ORIGIN` overrides
  /// the configured origin.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("OFFSYNC_SERVER_ORIGIN") {
      config.server.origin = origin;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
server:
  origin: https://app.example.com
  user_data_prefixes: ["/api/me/"]
sync:
  batch_size: 10
messages:
  offline:
    api: "Offline - showing saved data"
"#,
    )
    .unwrap();

    assert_eq!(config.server.origin, "https://app.example.com");
    assert_eq!(config.server.api_prefix, "/api/");
    assert_eq!(config.server.user_data_prefixes, vec!["/api/me/"]);
    assert_eq!(config.sync.batch_size, 10);
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.cache.backend, StorageBackend::Sqlite);
    assert_eq!(
      config.messages.offline[&OfflineKind::Api],
      "Offline - showing saved data"
    );
  }

  #[test]
  fn test_empty_yaml_is_default() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.network.stabilization_ms, 500);
    assert_eq!(config.cache.timeout(), Duration::from_secs(5));
    assert_eq!(config.compute.timeout(), Duration::from_secs(30));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }
}
