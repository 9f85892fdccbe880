use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Cache version prefix; tiers are named `{version}-{kind}`
  pub version: String,
  /// Base URL that relative request URLs resolve against
  pub origin: String,
  pub routing: RoutingConfig,
  pub cache: CacheConfig,
  pub network: NetworkConfig,
  pub queue: QueueConfig,
  pub analytics: AnalyticsConfig,
  pub storage: StorageConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: "offsync-v1".to_string(),
      origin: "http://localhost:8000/".to_string(),
      routing: RoutingConfig::default(),
      cache: CacheConfig::default(),
      network: NetworkConfig::default(),
      queue: QueueConfig::default(),
      analytics: AnalyticsConfig::default(),
      storage: StorageConfig::default(),
    }
  }
}

/// Static classification table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Path prefixes served by the API (e.g. "/api/")
  pub api_prefixes: Vec<String>,
  /// Individual API paths outside the prefixes
  pub api_endpoints: Vec<String>,
  /// Build assets precached at install and always treated as static
  pub static_manifest: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      api_prefixes: vec!["/api/".to_string()],
      api_endpoints: Vec::new(),
      static_manifest: vec!["/".to_string(), "/index.html".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Entry bound per tier
  pub max_entries: usize,
  /// How long a cached API response stays valid for offline fallback
  pub expiry_hours: u32,
  /// Minimum time between expired-entry sweeps
  pub sweep_interval_minutes: u32,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_entries: 50,
      expiry_hours: 24,
      sweep_interval_minutes: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-attempt fetch timeout
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Hard cap on queued items
  pub max_len: usize,
  /// Items kept (most recent) when the cap is exceeded
  pub keep_on_overflow: usize,
  /// Failed replays after which an item is discarded
  pub max_attempts: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_len: 50,
      keep_on_overflow: 25,
      max_attempts: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
  /// Batch endpoint, relative to `origin` unless absolute
  pub endpoint: String,
}

impl Default for AnalyticsConfig {
  fn default() -> Self {
    Self {
      endpoint: "/api/analytics/batch".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite database path (default: $XDG_DATA_HOME/offsync/offsync.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
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
    let config: Config = serde_yaml::from_str(contents)?;
    config.origin_url()?;
    if config.queue.keep_on_overflow > config.queue.max_len {
      return Err(eyre!(
        "queue.keep_on_overflow ({}) must not exceed queue.max_len ({})",
        config.queue.keep_on_overflow,
        config.queue.max_len
      ));
    }
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a possibly relative URL against `origin`.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  /// Database path, honouring the `OFFSYNC_DB` environment variable.
  pub fn database_path(&self) -> Option<PathBuf> {
    std::env::var_os("OFFSYNC_DB")
      .map(PathBuf::from)
      .or_else(|| self.storage.path.clone())
  }
}
