use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Host application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: LayerConfig,
  #[serde(default)]
  pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the data service, e.g. "https://api.example.com/v1"
  pub url: String,
  /// Default page size for feed reads
  #[serde(default = "default_page_size")]
  pub page_size: u32,
}

fn default_page_size() -> u32 {
  20
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
  /// Mirror the cache to disk so it survives restarts
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Database location (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

fn default_true() -> bool {
  true
}

/// Options recognized by the data-access layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
  pub default_ttl_ms: u64,
  pub max_cache_entries: usize,
  pub max_retry_attempts: u32,
  pub retry_base_delay_ms: u64,
  pub retry_max_delay_ms: u64,
  pub request_timeout_ms: u64,
  pub stale_while_revalidate: bool,
  /// How long an optimistic feed item may wait for server confirmation
  pub optimistic_timeout_ms: u64,
  /// TTL for dashboard aggregates (minutes, not seconds)
  pub stats_ttl_ms: u64,
}

impl Default for LayerConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 30_000,
      max_cache_entries: 500,
      max_retry_attempts: 3,
      retry_base_delay_ms: 250,
      retry_max_delay_ms: 10_000,
      request_timeout_ms: 15_000,
      stale_while_revalidate: true,
      optimistic_timeout_ms: 30_000,
      stats_ttl_ms: 300_000,
    }
  }
}

impl LayerConfig {
  /// Reject settings the layer cannot honor.
  pub fn validate(&self) -> Result<()> {
    if self.max_cache_entries == 0 {
      return Err(eyre!("cache.max_cache_entries must be at least 1"));
    }
    if self.max_retry_attempts == 0 {
      return Err(eyre!("cache.max_retry_attempts must be at least 1"));
    }
    if self.retry_base_delay_ms > self.retry_max_delay_ms {
      return Err(eyre!(
        "cache.retry_base_delay_ms ({}) must not exceed cache.retry_max_delay_ms ({})",
        self.retry_base_delay_ms,
        self.retry_max_delay_ms
      ));
    }
    if self.request_timeout_ms == 0 {
      return Err(eyre!("cache.request_timeout_ms must be positive"));
    }
    Ok(())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./feedcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feedcache/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/feedcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("feedcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("feedcache").join("config.yaml");
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
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.cache.validate()?;
    Ok(config)
  }

  /// Get the backend API token from the environment, if one is set.
  ///
  /// Checks FEEDCACHE_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FEEDCACHE_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("backend:\n  url: http://localhost:8080\n").unwrap();
    assert_eq!(config.backend.page_size, 20);
    assert_eq!(config.cache, LayerConfig::default());
    assert!(config.persistence.enabled);
    assert_eq!(config.cache.max_retry_attempts, 3);
    assert_eq!(config.cache.request_timeout_ms, 15_000);
  }

  #[test]
  fn test_partial_cache_section() {
    let yaml = r#"
backend:
  url: http://localhost:8080
  page_size: 50
cache:
  default_ttl_ms: 1000
  stale_while_revalidate: false
persistence:
  enabled: false
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.backend.page_size, 50);
    assert_eq!(config.cache.default_ttl_ms, 1000);
    assert!(!config.cache.stale_while_revalidate);
    assert_eq!(config.cache.max_cache_entries, 500);
    assert!(!config.persistence.enabled);
  }

  #[test]
  fn test_invalid_layer_config_is_rejected() {
    let yaml = r#"
backend:
  url: http://localhost:8080
cache:
  retry_base_delay_ms: 5000
  retry_max_delay_ms: 100
"#;
    assert!(Config::from_yaml(yaml).is_err());

    let zero = LayerConfig {
      max_cache_entries: 0,
      ..LayerConfig::default()
    };
    assert!(zero.validate().is_err());
  }
}
