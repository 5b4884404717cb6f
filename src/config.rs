use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::CacheSettings;
use crate::error::CacheError;
use crate::request::normalize_url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL the app is served from; relative manifest entries resolve against it
  pub origin: String,
  /// Bucket name prefix; the bucket is named `<cache_prefix>-<version>`
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// Bump on every asset change
  pub version: String,
  #[serde(default)]
  pub strategy: Strategy,
  /// Manifest entry served to navigations when offline
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Store successful same-origin network responses for next time
  #[serde(default = "default_true")]
  pub runtime_caching: bool,
  pub manifest: Vec<String>,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub server: ServerConfig,
}

fn default_cache_prefix() -> String {
  "timetable".to_string()
}

fn default_offline_page() -> String {
  "./offline.html".to_string()
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Serve from the bucket when possible; network on miss; offline page for
  /// failed navigations
  #[default]
  CacheFirst,
  /// Navigations go to the network first and refresh the bucket; other
  /// requests are cache-first without offline substitution
  NetworkFirst,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  #[serde(default = "default_user_agent")]
  pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_user_agent() -> String {
  concat!("swcache/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
      user_agent: default_user_agent(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
  #[default]
  Sqlite,
  /// Nothing survives the process; handy for trying a manifest out
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub kind: StorageKind,
  /// SQLite file (defaults to $XDG_DATA_HOME/swcache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8787))
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      listen: default_listen(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
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
        "No configuration file found. Create one at ~/.config/swcache/config.yaml\n\
                 See swcache.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    config.cache_settings()?;

    Ok(config)
  }

  /// Name of the bucket owned by this version.
  pub fn bucket_name(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.version)
  }

  /// Resolve the manifest against the origin and validate it.
  pub fn cache_settings(&self) -> std::result::Result<CacheSettings, CacheError> {
    if self.version.trim().is_empty() {
      return Err(CacheError::Config("version must not be empty".into()));
    }

    let mut origin = Url::parse(&self.origin)
      .map_err(|e| CacheError::Config(format!("invalid origin '{}': {}", self.origin, e)))?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(CacheError::Config(format!(
        "origin must be http or https, got '{}'",
        self.origin
      )));
    }
    // Treat the origin path as a directory so "./x" resolves beneath it
    if !origin.path().ends_with('/') {
      let path = format!("{}/", origin.path());
      origin.set_path(&path);
    }

    let mut manifest: Vec<Url> = Vec::with_capacity(self.manifest.len());
    let mut cross_origin: Option<Url> = None;
    for entry in &self.manifest {
      let url = origin
        .join(entry)
        .map(|url| normalize_url(&url))
        .map_err(|e| CacheError::Config(format!("invalid manifest entry '{}': {}", entry, e)))?;

      if url.origin() != origin.origin() {
        if let Some(existing) = &cross_origin {
          if existing != &url {
            return Err(CacheError::Config(format!(
              "manifest may list at most one cross-origin URL (found {} and {})",
              existing, url
            )));
          }
        }
        cross_origin = Some(url.clone());
      }

      if !manifest.contains(&url) {
        manifest.push(url);
      }
    }

    let offline_page = origin
      .join(&self.offline_page)
      .map(|url| normalize_url(&url))
      .map_err(|e| {
        CacheError::Config(format!(
          "invalid offline page '{}': {}",
          self.offline_page, e
        ))
      })?;
    if !manifest.contains(&offline_page) {
      return Err(CacheError::Config(format!(
        "offline page {} is not listed in the manifest",
        offline_page
      )));
    }

    Ok(CacheSettings {
      origin,
      bucket: self.bucket_name(),
      manifest,
      offline_page,
      cross_origin,
      strategy: self.strategy,
      runtime_caching: self.runtime_caching,
    })
  }
}
