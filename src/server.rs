//! Local host driver: an axum front that routes every browser request through the cache manager.

use axum::{
  body::{to_bytes, Body},
  extract::{Request as HttpRequest, State},
  http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
  response::{IntoResponse, Response},
  Router,
};
use color_eyre::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheManager, CacheStorage, FetchOutcome, ResponseSource, StoredResponse};
use crate::network::Network;
use crate::request::{Destination, Request};

/// Largest request body forwarded to the network (2 MB).
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Response header naming where the body came from.
pub const SOURCE_HEADER: &str = "x-swcache-source";

/// Build the router; every path is handled by the manager.
pub fn router<S, N>(manager: CacheManager<S, N>) -> Router
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  Router::new()
    .fallback(intercept_handler::<S, N>)
    .with_state(manager)
}

/// Bring the manager into control, then serve until Ctrl-C.
///
/// A failed install is logged; serving continues with whatever the bucket holds.
pub async fn serve<S, N>(manager: CacheManager<S, N>, listen: SocketAddr) -> Result<()>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  match manager.start().await {
    Ok(outcome) => info!(
      bucket = manager.bucket(),
      reused = outcome.installed.is_none(),
      evicted = outcome.activated.deleted.len(),
      claimed = outcome.activated.clients_claimed,
      "Cache manager active"
    ),
    Err(e) => warn!(error = %e, "Cache manager did not activate"),
  }

  let listener = TcpListener::bind(listen).await?;
  info!(
    addr = %listener.local_addr()?,
    origin = %manager.settings().origin,
    phase = ?manager.phase(),
    "Serving"
  );

  axum::serve(listener, router(manager))
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

  Ok(())
}

/// Classify a browser request from its fetch metadata headers.
fn destination_from_headers(headers: &HeaderMap) -> Destination {
  if header_str(headers, "sec-fetch-mode") == Some("navigate") {
    return Destination::Document;
  }
  if let Some(dest) = header_str(headers, "sec-fetch-dest") {
    return Destination::from_fetch_dest(dest);
  }
  // No fetch metadata (curl, old browsers): treat HTML-accepting loads as navigations
  match header_str(headers, header::ACCEPT.as_str()) {
    Some(accept) if accept.contains("text/html") => Destination::Document,
    _ => Destination::Other,
  }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
  headers.get(name).and_then(|v| v.to_str().ok())
}

/// Translate the incoming request onto the configured origin.
async fn into_request(origin: &Url, request: HttpRequest) -> std::result::Result<Request, String> {
  let (parts, body) = request.into_parts();

  // The host always comes from the configured origin, never from the target
  let mut url = origin.clone();
  url.set_path(parts.uri.path());
  url.set_query(parts.uri.query());

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| *name != header::ACCEPT_ENCODING)
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let body = to_bytes(body, MAX_REQUEST_BODY_BYTES)
    .await
    .map_err(|e| format!("failed to read request body: {}", e))?;

  Ok(
    Request::new(parts.method, url, destination_from_headers(&parts.headers))
      .with_headers(headers)
      .with_body(body),
  )
}

fn to_response(stored: StoredResponse, source: Option<ResponseSource>) -> Response {
  let mut response = Response::new(Body::from(stored.body));
  *response.status_mut() = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::BAD_GATEWAY);

  let headers = response.headers_mut();
  for (name, value) in &stored.headers {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  if let Some(source) = source {
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
  }

  response
}

async fn intercept_handler<S, N>(
  State(manager): State<CacheManager<S, N>>,
  request: HttpRequest,
) -> Response
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let request = match into_request(&manager.settings().origin, request).await {
    Ok(r) => r,
    Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
  };

  let outcome = match manager.handle_fetch(&request).await {
    Ok(outcome) => outcome,
    Err(e) => {
      debug!(url = %request.url, error = %e, "Request failed");
      return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
    }
  };

  match outcome {
    FetchOutcome::Respond(served) => to_response(served.response, Some(served.source)),
    FetchOutcome::PassThrough => match manager.network().fetch(&request).await {
      Ok(response) => to_response(response, None),
      Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    },
  }
}
