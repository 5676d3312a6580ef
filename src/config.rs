use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::lifecycle::Generation;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin that relative request targets resolve against
  pub origin: String,
  /// Name of the store generation this configuration provisions.
  /// Must change whenever `preload` changes.
  pub generation: Generation,
  /// Root-relative paths that must be available offline
  pub preload: Vec<String>,
  pub routes: RoutesConfig,
  pub network: NetworkConfig,
  pub store: StoreConfig,
  pub lifecycle: LifecycleConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      generation: Generation::new("shell-v1"),
      preload: vec![
        "/".to_string(),
        "/favicon.png".to_string(),
        "/manifest.json".to_string(),
      ],
      routes: RoutesConfig::default(),
      network: NetworkConfig::default(),
      store: StoreConfig::default(),
      lifecycle: LifecycleConfig::default(),
      log: LogConfig::default(),
    }
  }
}

/// Pattern tables for request classification.
///
/// Every pattern is matched by plain substring containment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Paths beginning with this prefix are API reads
  pub api_prefix: String,
  /// API path substrings that must never touch the store
  pub skip: Vec<String>,
  /// Host or extension fragments served cache-first
  pub cache_first: Vec<String>,
  /// Bundle extensions served stale-while-revalidate (also the default)
  pub stale_while_revalidate: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
    Self {
      api_prefix: "/api/".to_string(),
      skip: strings(&["/api/auth", "/api/dashboard", "/api/notifications"]),
      cache_first: strings(&[
        "fonts.googleapis.com",
        "fonts.gstatic.com",
        "manifest.json",
        ".png",
        ".jpg",
        ".jpeg",
        ".gif",
        ".svg",
        ".webp",
        ".ico",
        ".woff2",
      ]),
      stale_while_revalidate: strings(&[".js", ".css"]),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// SQLite file holding every generation (default: $XDG_DATA_HOME/shellcache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Activate a freshly provisioned generation without waiting
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to built-in defaults when nothing is found.
  /// `SHELLCACHE_ORIGIN` overrides `origin` either way.
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

    if let Ok(origin) = std::env::var("SHELLCACHE_ORIGIN") {
      config.origin = origin;
    }

    config.origin()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
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

  /// Parsed origin URL.
  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Resolve a request target: absolute URLs pass through, paths join the origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    match Url::parse(target) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => self
        .origin()?
        .join(target)
        .map_err(|e| eyre!("Invalid request target {}: {}", target, e)),
      Err(e) => Err(eyre!("Invalid request target {}: {}", target, e)),
    }
  }
}
