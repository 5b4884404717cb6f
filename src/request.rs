//! Intercepted request model and its classification.
//!
//! Requests are classified on three axes: HTTP method (only GET is cacheable),
//! origin (same-origin vs cross-origin), and navigation intent (whether the
//! browser is loading a new top-level document).

use bytes::Bytes;
use reqwest::Method;
use url::Url;

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  /// Top-level page load.
  Document,
  Script,
  Style,
  Image,
  Font,
  Manifest,
  #[default]
  Other,
}

impl Destination {
  /// Parse the value of a `Sec-Fetch-Dest` header.
  pub fn from_fetch_dest(value: &str) -> Self {
    match value.trim().to_ascii_lowercase().as_str() {
      "document" | "iframe" | "frame" => Destination::Document,
      "script" | "worker" | "sharedworker" => Destination::Script,
      "style" => Destination::Style,
      "image" => Destination::Image,
      "font" => Destination::Font,
      "manifest" => Destination::Manifest,
      _ => Destination::Other,
    }
  }
}

/// A request routed through the cache manager.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  /// Headers forwarded when the request goes to the network.
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Request {
  pub fn new(method: Method, url: Url, destination: Destination) -> Self {
    Self {
      method,
      url,
      destination,
      headers: Vec::new(),
      body: Bytes::new(),
    }
  }

  /// A subresource GET (script, style, image, data).
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url, Destination::Other)
  }

  /// A top-level document load.
  #[allow(dead_code)]
  pub fn navigate(url: Url) -> Self {
    Self::new(Method::GET, url, Destination::Document)
  }

  pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
    self.headers = headers;
    self
  }

  pub fn with_body(mut self, body: Bytes) -> Self {
    self.body = body;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.destination == Destination::Document
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }
}

/// Strip the fragment; the cache never distinguishes `#anchors`.
pub fn normalize_url(url: &Url) -> Url {
  let mut url = url.clone();
  url.set_fragment(None);
  url
}
