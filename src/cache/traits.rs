//! Core types for the bucket cache: request identity, stored responses, and
//! where a served response came from.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::request::{normalize_url, Request};

/// Identity of a cached request: method plus absolute URL (fragment removed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    Self(format!("{} {}", method.as_str(), normalize_url(url)))
  }

  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }

  /// Rebuild a key from its stored text form.
  pub fn from_raw(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 of the key text, used as a stable fixed-length row id.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// A response as held in a bucket or returned by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  /// Set when the response was read back out of a bucket.
  pub cached_at: Option<DateTime<Utc>>,
}

impl StoredResponse {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
      cached_at: None,
    }
  }

  /// A successful HTML document, mostly useful for fixtures.
  #[allow(dead_code)]
  pub fn html(body: impl Into<Bytes>) -> Self {
    Self::new(
      200,
      vec![("content-type".into(), "text/html; charset=utf-8".into())],
      body,
    )
  }

  /// Minimal notice returned when neither network nor bucket can answer a
  /// navigation.
  pub fn offline_notice() -> Self {
    Self::new(
      503,
      vec![
        ("content-type".into(), "text/html; charset=utf-8".into()),
        ("cache-control".into(), "no-store".into()),
      ],
      OFFLINE_NOTICE,
    )
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  #[allow(dead_code)]
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

const OFFLINE_NOTICE: &str = "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>The timetable is not available right now. Reconnect and try again.</p></body></html>\n";

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Stored entry for this exact request
  Cache,
  /// The configured offline fallback page
  OfflinePage,
  /// Neither network nor bucket could answer; minimal 503 notice
  Synthesized,
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseSource::Network => "network",
      ResponseSource::Cache => "cache",
      ResponseSource::OfflinePage => "offline-page",
      ResponseSource::Synthesized => "synthesized",
    }
  }
}

/// A response chosen by the manager, with metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: StoredResponse,
  pub source: ResponseSource,
}

impl Served {
  pub fn from_network(response: StoredResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(response: StoredResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
    }
  }

  pub fn offline_page(response: StoredResponse) -> Self {
    Self {
      response,
      source: ResponseSource::OfflinePage,
    }
  }

  pub fn synthesized() -> Self {
    Self {
      response: StoredResponse::offline_notice(),
      source: ResponseSource::Synthesized,
    }
  }
}

/// Outcome of intercepting one request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not intercepted: the host performs its normal, uncached request.
  PassThrough,
  /// The manager answered.
  Respond(Served),
}
