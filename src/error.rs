//! Error taxonomy for the cache manager.
//!
//! The binary reports these through color-eyre; library code returns them directly.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
  /// The network could not produce a response (offline, DNS, timeout, reset).
  #[error("Network request for {url} failed: {message}")]
  Network { url: String, message: String },

  /// The bucket store failed (quota, corruption, I/O).
  #[error("Cache storage error: {0}")]
  Storage(String),

  /// Pre-caching the asset manifest did not complete.
  #[error("Install of {bucket} failed: {reason}")]
  Install { bucket: String, reason: String },

  /// Activate was requested before install for this version completed.
  #[error("Cannot activate {bucket}: install has not completed")]
  NotInstalled { bucket: String },

  #[error("Invalid configuration: {0}")]
  Config(String),
}

impl CacheError {
  pub fn network(url: impl Into<String>, message: impl ToString) -> Self {
    CacheError::Network {
      url: url.into(),
      message: message.to_string(),
    }
  }

  pub fn storage(message: impl ToString) -> Self {
    CacheError::Storage(message.to_string())
  }

  #[allow(dead_code)]
  pub fn is_network(&self) -> bool {
    matches!(self, CacheError::Network { .. })
  }
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    CacheError::Storage(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, CacheError>;
