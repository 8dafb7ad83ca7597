use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::worker::WorkerSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the web application being proxied (e.g. "http://127.0.0.1:8501")
  pub upstream: String,
  /// Address the proxy listens on
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Largest request body the proxy will buffer
  #[serde(default = "default_max_body_bytes")]
  pub max_body_bytes: usize,
  /// Write logs to daily files in this directory instead of stderr
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Cache bucket name. Bump it whenever the cached content changes.
  #[serde(default = "default_version")]
  pub version: String,
  /// Paths fetched and stored on install, relative to the upstream origin
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// SQLite database file (defaults to $XDG_DATA_HOME/offcache/cache.db)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_version(),
      precache: default_precache(),
      database: None,
    }
  }
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_body_bytes() -> usize {
  16 * 1024 * 1024
}

fn default_version() -> String {
  "offcache-v1".to_string()
}

/// The application shell and its PWA assets.
fn default_precache() -> Vec<String> {
  [
    "/",
    "/manifest.json",
    "/service-worker.js",
    "/static/icon-192.png",
    "/static/icon-512.png",
    "/static/style.css",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
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
        "No configuration file found. Create one at ~/.config/offcache/config.yaml\n\
                 with at least an `upstream:` origin URL."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    config.upstream_url()?;
    if config.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }

    Ok(config)
  }

  pub fn upstream_url(&self) -> Result<Url> {
    let url = Url::parse(&self.upstream)
      .map_err(|e| eyre!("Invalid upstream URL '{}': {}", self.upstream, e))?;

    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Upstream must be an http(s) origin, got '{}'", self.upstream));
    }

    Ok(url)
  }

  /// Pre-cache paths resolved against the upstream origin.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    let origin = self.upstream_url()?;

    self
      .cache
      .precache
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid pre-cache path '{}': {}", path, e))
      })
      .collect()
  }

  pub fn worker_settings(&self) -> Result<WorkerSettings> {
    Ok(WorkerSettings {
      version: self.cache.version.clone(),
      origin: self.upstream_url()?,
      precache: self.precache_urls()?,
    })
  }

  /// Get the cache database path.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache").join("cache.db"))
  }
}
