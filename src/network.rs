//! Network access for the cache manager.

use async_trait::async_trait;
use std::time::Duration;

use crate::cache::StoredResponse;
use crate::config::NetworkConfig;
use crate::error::{CacheError, Result};
use crate::request::Request;

/// Anything that can turn a request into a response over the network.
///
/// An HTTP error status is still a response; only transport failures
/// (offline, DNS, timeout, reset) are errors.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<StoredResponse>;
}

/// Hop-by-hop headers that must not be forwarded or stored.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-connection",
  "transfer-encoding",
  "upgrade",
  "te",
  "trailer",
  "host",
  "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(config.user_agent.clone())
      .build()
      .map_err(|e| CacheError::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<StoredResponse> {
    let url = request.url.as_str();

    let mut builder = self.client.request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| CacheError::network(url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| CacheError::network(url, e))?;

    Ok(StoredResponse::new(status, headers, body))
  }
}
