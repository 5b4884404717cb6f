//! Asset cache manager: versioned pre-caching, stale bucket eviction, and the
//! per-request choice between bucket, network, and offline fallback.

use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{FetchOutcome, RequestKey, Served, StoredResponse};
use crate::config::Strategy;
use crate::error::{CacheError, Result};
use crate::network::Network;
use crate::request::{normalize_url, Request};

/// Resolved, validated settings for one deployed version.
#[derive(Debug, Clone)]
pub struct CacheSettings {
  pub origin: Url,
  /// Name of the current bucket, e.g. `timetable-v9`
  pub bucket: String,
  /// Absolute manifest URLs in declaration order
  pub manifest: Vec<Url>,
  pub offline_page: Url,
  /// The one cross-origin manifest URL that is intercepted
  pub cross_origin: Option<Url>,
  pub strategy: Strategy,
  pub runtime_caching: bool,
}

/// Lifecycle phase of this manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install failed; this instance must never activate
  Redundant,
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
  pub bucket: String,
  pub cached: usize,
  /// Take control immediately instead of waiting for older instances
  pub skip_waiting: bool,
}

#[derive(Debug, Clone)]
pub struct ActivateOutcome {
  /// Stale buckets removed by this activation
  pub deleted: Vec<String>,
  /// Open pages are controlled right away, not only new navigations
  pub clients_claimed: bool,
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
  /// `None` when an already populated bucket was reused
  pub installed: Option<InstallOutcome>,
  pub activated: ActivateOutcome,
}

/// Keeps one versioned bucket of the app's assets and answers intercepted
/// requests from it.
pub struct CacheManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  settings: Arc<CacheSettings>,
  phase: Arc<Mutex<Phase>>,
  /// Serializes install and activate
  lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl<S: CacheStorage, N: Network> CacheManager<S, N> {
  pub fn new(settings: CacheSettings, storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      storage,
      network,
      settings: Arc::new(settings),
      phase: Arc::new(Mutex::new(Phase::Parsed)),
      lifecycle: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.settings
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  pub fn bucket(&self) -> &str {
    &self.settings.bucket
  }

  pub fn phase(&self) -> Phase {
    *self.phase.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_phase(&self, phase: Phase) {
    *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Pre-cache every manifest URL into the current bucket.
  ///
  /// All fetches must succeed before anything is written; one failure fails
  /// the install and leaves this instance `Redundant`.
  pub async fn install(&self) -> Result<InstallOutcome> {
    let _lifecycle = self.lifecycle.lock().await;
    let bucket = self.bucket();

    info!(bucket, assets = self.settings.manifest.len(), "Install");
    self.set_phase(Phase::Installing);

    match self.precache().await {
      Ok(cached) => {
        self.set_phase(Phase::Installed);
        info!(bucket, cached, "Cached app shell");
        Ok(InstallOutcome {
          bucket: bucket.to_string(),
          cached,
          skip_waiting: true,
        })
      }
      Err(e) => {
        self.set_phase(Phase::Redundant);
        error!(bucket, error = %e, "Failed to cache files during install");
        Err(CacheError::Install {
          bucket: bucket.to_string(),
          reason: e.to_string(),
        })
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let bucket = self.bucket();
    self.storage.open_bucket(bucket).await?;

    let fetches = self.settings.manifest.iter().map(|url| async move {
      let response = self.network.fetch(&Request::get(url.clone())).await?;
      if !response.is_success() {
        return Err(CacheError::network(
          url.as_str(),
          format!("unexpected status {}", response.status),
        ));
      }
      Ok::<_, CacheError>((RequestKey::get(url), response))
    });
    let entries = try_join_all(fetches).await?;

    self.storage.put_batch(bucket, &entries).await?;
    Ok(entries.len())
  }

  /// Delete every bucket except the current one and take control of pages.
  ///
  /// Requires a completed install. Running it again deletes nothing new.
  pub async fn activate(&self) -> Result<ActivateOutcome> {
    let _lifecycle = self.lifecycle.lock().await;
    let bucket = self.bucket();

    let previous = self.phase();
    if !matches!(previous, Phase::Installed | Phase::Activated) {
      return Err(CacheError::NotInstalled {
        bucket: bucket.to_string(),
      });
    }

    info!(bucket, "Activate");
    self.set_phase(Phase::Activating);

    match self.evict_stale().await {
      Ok(deleted) => {
        self.set_phase(Phase::Activated);
        Ok(ActivateOutcome {
          deleted,
          clients_claimed: true,
        })
      }
      Err(e) => {
        self.set_phase(previous);
        Err(e)
      }
    }
  }

  async fn evict_stale(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.bucket_names().await? {
      if name != self.settings.bucket {
        info!(bucket = %name, "Deleting old cache");
        if self.storage.delete_bucket(&name).await? {
          deleted.push(name);
        }
      }
    }
    Ok(deleted)
  }

  /// Bring this instance into control the way a restarted host would: reuse
  /// the current bucket if it already holds the whole manifest, otherwise
  /// install, then activate.
  pub async fn start(&self) -> Result<StartOutcome> {
    let installed = if self.is_populated().await? {
      self.adopt_existing().await;
      debug!(bucket = self.bucket(), "Bucket already populated, skipping install");
      None
    } else {
      Some(self.install().await?)
    };

    let activated = self.activate().await?;
    Ok(StartOutcome {
      installed,
      activated,
    })
  }

  async fn adopt_existing(&self) {
    let _lifecycle = self.lifecycle.lock().await;
    if matches!(self.phase(), Phase::Parsed | Phase::Redundant) {
      self.set_phase(Phase::Installed);
    }
  }

  /// Whether the current bucket holds every manifest entry.
  pub async fn is_populated(&self) -> Result<bool> {
    if !self.storage.has_bucket(self.bucket()).await? {
      return Ok(false);
    }
    let keys = self.storage.keys(self.bucket()).await?;
    Ok(
      self
        .settings
        .manifest
        .iter()
        .all(|url| keys.contains(&RequestKey::get(url))),
    )
  }

  // ==========================================================================
  // Fetch interception
  // ==========================================================================

  /// Whether this request is ours to answer.
  pub fn should_intercept(&self, request: &Request) -> bool {
    if !request.is_get() {
      return false;
    }
    if request.is_same_origin(&self.settings.origin) {
      return true;
    }
    self
      .settings
      .cross_origin
      .as_ref()
      .is_some_and(|allowed| *allowed == normalize_url(&request.url))
  }

  /// Decide how to answer one intercepted request.
  ///
  /// Navigations always resolve to some renderable response. Other requests
  /// surface a network error only when neither bucket nor network can answer.
  pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    if !self.should_intercept(request) {
      debug!(method = %request.method, url = %request.url, "Passing through");
      return Ok(FetchOutcome::PassThrough);
    }

    let served = match (self.settings.strategy, request.is_navigation()) {
      (Strategy::NetworkFirst, true) => self.network_first(request).await,
      _ => self.cache_first(request).await?,
    };

    debug!(
      url = %request.url,
      source = served.source.as_str(),
      status = served.response.status,
      "Responding"
    );
    Ok(FetchOutcome::Respond(served))
  }

  async fn cache_first(&self, request: &Request) -> Result<Served> {
    let key = RequestKey::from_request(request);

    if let Some(cached) = self.lookup(&key).await {
      debug!(url = %request.url, cached_at = ?cached.cached_at, "Returning cached response");
      return Ok(Served::from_cache(cached));
    }

    debug!(url = %request.url, "Fetching from network");
    match self.network.fetch(request).await {
      Ok(response) => {
        self.remember(request, &key, &response).await;
        Ok(Served::from_network(response))
      }
      Err(e) if request.is_navigation() => {
        debug!(url = %request.url, error = %e, "Network fetch failed, serving offline page");
        Ok(self.offline_fallback().await)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network fetch failed");
        Err(e)
      }
    }
  }

  async fn network_first(&self, request: &Request) -> Served {
    let key = RequestKey::from_request(request);

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&key, &response).await;
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network fetch failed, trying cache");
        match self.lookup(&key).await {
          Some(cached) => Served::from_cache(cached),
          None => self.offline_fallback().await,
        }
      }
    }
  }

  async fn offline_fallback(&self) -> Served {
    match self.lookup(&RequestKey::get(&self.settings.offline_page)).await {
      Some(page) => Served::offline_page(page),
      None => {
        warn!(bucket = self.bucket(), "Offline page missing from cache, synthesizing response");
        Served::synthesized()
      }
    }
  }

  /// Bucket lookup where a storage failure counts as a miss.
  async fn lookup(&self, key: &RequestKey) -> Option<StoredResponse> {
    match self.storage.get(self.bucket(), key).await {
      Ok(found) => found,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
        None
      }
    }
  }

  /// Opportunistic runtime caching of a network response.
  async fn remember(&self, request: &Request, key: &RequestKey, response: &StoredResponse) {
    if self.settings.runtime_caching
      && response.is_success()
      && request.is_same_origin(&self.settings.origin)
    {
      self.store(key, response).await;
    }
  }

  async fn store(&self, key: &RequestKey, response: &StoredResponse) {
    if let Err(e) = self.storage.put(self.bucket(), key, response).await {
      warn!(key = %key, error = %e, "Could not cache response");
    } else {
      debug!(key = %key, "Cached response");
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheManager<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      settings: Arc::clone(&self.settings),
      phase: Arc::clone(&self.phase),
      lifecycle: Arc::clone(&self.lifecycle),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::traits::ResponseSource;
  use crate::config::Config;
  use crate::network::testing::FakeNetwork;
  use async_trait::async_trait;
  use reqwest::Method;
  use std::sync::atomic::{AtomicBool, Ordering};

  const ORIGIN: &str = "http://localhost:8080/";
  const FONT_CSS: &str = "https://fonts.googleapis.com/css2?family=Roboto";

  fn site(version: &str) -> FakeNetwork {
    let network = FakeNetwork::default();
    for path in ["", "index.html", "offline.html", "styles.css", "app.js"] {
      network.serve(
        &format!("{}{}", ORIGIN, path),
        StoredResponse::html(format!("{} {}", path, version)),
      );
    }
    network.serve(FONT_CSS, StoredResponse::new(200, vec![], "@font-face {}"));
    network
  }

  /// Storage double whose reads can be made to fail.
  #[derive(Default)]
  struct FlakyStorage {
    inner: MemoryStorage,
    fail_reads: AtomicBool,
  }

  #[async_trait]
  impl CacheStorage for FlakyStorage {
    async fn bucket_names(&self) -> Result<Vec<String>> {
      self.inner.bucket_names().await
    }
    async fn has_bucket(&self, name: &str) -> Result<bool> {
      self.inner.has_bucket(name).await
    }
    async fn open_bucket(&self, name: &str) -> Result<()> {
      self.inner.open_bucket(name).await
    }
    async fn delete_bucket(&self, name: &str) -> Result<bool> {
      self.inner.delete_bucket(name).await
    }
    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
      if self.fail_reads.load(Ordering::SeqCst) {
        return Err(CacheError::storage("database disk image is malformed"));
      }
      self.inner.get(bucket, key).await
    }
    async fn put(&self, bucket: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
      self.inner.put(bucket, key, response).await
    }
    async fn put_batch(&self, bucket: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
      self.inner.put_batch(bucket, entries).await
    }
    async fn delete(&self, bucket: &str, key: &RequestKey) -> Result<bool> {
      self.inner.delete(bucket, key).await
    }
    async fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
      self.inner.keys(bucket).await
    }
  }

  fn settings(version: &str, strategy: &str) -> CacheSettings {
    let yaml = format!(
      r#"
origin: "{ORIGIN}"
version: {version}
strategy: {strategy}
manifest:
  - ./
  - ./index.html
  - ./offline.html
  - ./styles.css
  - {FONT_CSS}
"#
    );
    Config::from_yaml(&yaml).unwrap().cache_settings().unwrap()
  }

  fn manager_with<S: CacheStorage>(
    version: &str,
    strategy: &str,
    storage: Arc<S>,
  ) -> CacheManager<S, FakeNetwork> {
    CacheManager::new(
      settings(version, strategy),
      storage,
      Arc::new(site(version)),
    )
  }

  fn manager(strategy: &str) -> CacheManager<MemoryStorage, FakeNetwork> {
    manager_with("v1", strategy, Arc::new(MemoryStorage::new()))
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn respond(outcome: FetchOutcome) -> Served {
    match outcome {
      FetchOutcome::Respond(served) => served,
      FetchOutcome::PassThrough => panic!("expected a response, got pass-through"),
    }
  }

  #[tokio::test]
  async fn test_install_caches_every_manifest_url() {
    let manager = manager("cache-first");
    let outcome = manager.install().await.unwrap();
    assert_eq!(outcome.bucket, "timetable-v1");
    assert_eq!(outcome.cached, 5);
    assert!(outcome.skip_waiting);
    assert_eq!(manager.phase(), Phase::Installed);

    manager.network().set_offline(true);
    let calls = manager.network().calls();
    for entry in manager.settings().manifest.clone() {
      let served = respond(manager.handle_fetch(&Request::get(entry)).await.unwrap());
      assert_eq!(served.source, ResponseSource::Cache);
      assert_eq!(served.response.status, 200);
    }
    assert_eq!(manager.network().calls(), calls);
  }

  #[tokio::test]
  async fn test_failed_install_writes_nothing_and_blocks_activate() {
    let manager = manager("cache-first");
    manager
      .network()
      .serve(&url("styles.css").to_string(), StoredResponse::new(500, vec![], "boom"));

    let err = manager.install().await.unwrap_err();
    assert!(matches!(err, CacheError::Install { .. }));
    assert_eq!(manager.phase(), Phase::Redundant);
    assert!(manager.storage().keys("timetable-v1").await.unwrap().is_empty());

    let err = manager.activate().await.unwrap_err();
    assert!(matches!(err, CacheError::NotInstalled { .. }));
  }

  #[tokio::test]
  async fn test_install_fails_when_offline() {
    let manager = manager("cache-first");
    manager.network().set_offline(true);
    assert!(manager.install().await.is_err());
    assert!(!manager.is_populated().await.unwrap());
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let manager = manager("cache-first");
    let err = manager.activate().await.unwrap_err();
    assert!(matches!(err, CacheError::NotInstalled { .. }));
    assert_eq!(manager.phase(), Phase::Parsed);
  }

  #[tokio::test]
  async fn test_version_bump_evicts_old_bucket() {
    let storage = Arc::new(MemoryStorage::new());
    let v1 = manager_with("v1", "cache-first", Arc::clone(&storage));
    v1.start().await.unwrap();
    storage.open_bucket("unrelated").await.unwrap();

    let v2 = manager_with("v2", "cache-first", Arc::clone(&storage));
    v2.install().await.unwrap();
    // Old instance keeps answering while the new one installs
    assert_eq!(
      storage.bucket_names().await.unwrap(),
      vec!["timetable-v1", "timetable-v2", "unrelated"]
    );

    let outcome = v2.activate().await.unwrap();
    assert!(outcome.clients_claimed);
    assert_eq!(outcome.deleted, vec!["timetable-v1", "unrelated"]);
    assert_eq!(storage.bucket_names().await.unwrap(), vec!["timetable-v2"]);
    assert_eq!(v2.phase(), Phase::Activated);
  }

  #[tokio::test]
  async fn test_activate_twice_deletes_nothing_more() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open_bucket("timetable-v0").await.unwrap();
    let manager = manager_with("v1", "cache-first", Arc::clone(&storage));
    manager.install().await.unwrap();

    assert_eq!(manager.activate().await.unwrap().deleted, vec!["timetable-v0"]);
    assert!(manager.activate().await.unwrap().deleted.is_empty());
  }

  #[tokio::test]
  async fn test_start_reuses_populated_bucket() {
    let storage = Arc::new(MemoryStorage::new());
    let first = manager_with("v1", "cache-first", Arc::clone(&storage));
    assert!(first.start().await.unwrap().installed.is_some());

    let restarted = manager_with("v1", "cache-first", Arc::clone(&storage));
    let outcome = restarted.start().await.unwrap();
    assert!(outcome.installed.is_none());
    assert_eq!(restarted.network().calls(), 0);
    assert_eq!(restarted.phase(), Phase::Activated);
  }

  #[tokio::test]
  async fn test_non_get_and_cross_origin_pass_through() {
    let manager = manager("cache-first");
    manager.start().await.unwrap();
    let calls = manager.network().calls();

    let post = Request::new(Method::POST, url("index.html"), Default::default());
    assert!(matches!(manager.handle_fetch(&post).await.unwrap(), FetchOutcome::PassThrough));

    let foreign = Request::get(Url::parse("https://api.example.com/timetable.json").unwrap());
    assert!(matches!(manager.handle_fetch(&foreign).await.unwrap(), FetchOutcome::PassThrough));

    assert_eq!(manager.network().calls(), calls);
  }

  #[tokio::test]
  async fn test_whitelisted_cross_origin_is_served_from_cache() {
    let manager = manager("cache-first");
    manager.start().await.unwrap();
    manager.network().set_offline(true);

    let font = Request::get(Url::parse(FONT_CSS).unwrap());
    let served = respond(manager.handle_fetch(&font).await.unwrap());
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body.as_ref(), b"@font-face {}");
  }

  #[tokio::test]
  async fn test_manifest_fragment_does_not_hide_cross_origin_entry() {
    let yaml = format!(
      "origin: \"{ORIGIN}\"\nversion: v1\nmanifest:\n  - ./\n  - ./offline.html\n  - \"{FONT_CSS}#latin\"\n"
    );
    let settings = Config::from_yaml(&yaml).unwrap().cache_settings().unwrap();
    let manager = CacheManager::new(settings, Arc::new(MemoryStorage::new()), Arc::new(site("v1")));
    manager.start().await.unwrap();
    manager.network().set_offline(true);

    let font = Request::get(Url::parse(FONT_CSS).unwrap());
    assert!(manager.should_intercept(&font));
    let served = respond(manager.handle_fetch(&font).await.unwrap());
    assert_eq!(served.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let manager = manager("cache-first");
    manager.start().await.unwrap();
    let calls = manager.network().calls();

    let served = respond(manager.handle_fetch(&Request::navigate(url("index.html"))).await.unwrap());
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body.as_ref(), b"index.html v1");
    assert_eq!(manager.network().calls(), calls);
  }

  #[tokio::test]
  async fn test_cache_first_offline_navigation_gets_offline_page() {
    let manager = manager("cache-first");
    manager.start().await.unwrap();
    manager.network().set_offline(true);

    let request = Request::navigate(url("week/2.html"));
    let served = respond(manager.handle_fetch(&request).await.unwrap());
    assert_eq!(served.source, ResponseSource::OfflinePage);
    assert_eq!(served.response.body.as_ref(), b"offline.html v1");
  }

  #[tokio::test]
  async fn test_offline_navigation_without_offline_page_is_unavailable() {
    for strategy in ["cache-first", "network-first"] {
      let manager = manager(strategy);
      manager.start().await.unwrap();
      manager
        .storage()
        .delete("timetable-v1", &RequestKey::get(&url("offline.html")))
        .await
        .unwrap();
      manager.network().set_offline(true);

      let served = respond(manager.handle_fetch(&Request::navigate(url("missing.html"))).await.unwrap());
      assert_eq!(served.source, ResponseSource::Synthesized);
      assert_eq!(served.response.status, 503);
    }
  }

  #[tokio::test]
  async fn test_cache_first_offline_subresource_miss_propagates() {
    let manager = manager("cache-first");
    manager.start().await.unwrap();
    manager.network().set_offline(true);

    let err = manager.handle_fetch(&Request::get(url("data/timetable.json"))).await.unwrap_err();
    assert!(err.is_network());
  }

  #[tokio::test]
  async fn test_runtime_caching_stores_only_successes() {
    let manager = manager("cache-first");
    manager.start().await.unwrap();

    let served = respond(manager.handle_fetch(&Request::get(url("app.js"))).await.unwrap());
    assert_eq!(served.source, ResponseSource::Network);
    let missing = served_status(&manager, "nope.png").await;
    assert_eq!(missing, 404);

    let bucket = manager.bucket().to_string();
    let storage = manager.storage();
    assert!(storage.get(&bucket, &RequestKey::get(&url("app.js"))).await.unwrap().is_some());
    assert!(storage.get(&bucket, &RequestKey::get(&url("nope.png"))).await.unwrap().is_none());

    manager.network().set_offline(true);
    let served = respond(manager.handle_fetch(&Request::get(url("app.js"))).await.unwrap());
    assert_eq!(served.source, ResponseSource::Cache);
  }

  async fn served_status(manager: &CacheManager<MemoryStorage, FakeNetwork>, path: &str) -> u16 {
    respond(manager.handle_fetch(&Request::get(url(path))).await.unwrap())
      .response
      .status
  }

  #[tokio::test]
  async fn test_runtime_caching_can_be_disabled() {
    let mut settings = settings("v1", "cache-first");
    settings.runtime_caching = false;
    let manager = CacheManager::new(
      settings,
      Arc::new(MemoryStorage::new()),
      Arc::new(site("v1")),
    );
    manager.start().await.unwrap();

    manager.handle_fetch(&Request::get(url("app.js"))).await.unwrap();
    let key = RequestKey::get(&url("app.js"));
    assert!(manager.storage().get("timetable-v1", &key).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_first_refreshes_navigation() {
    let manager = manager("network-first");
    manager.start().await.unwrap();
    manager
      .network()
      .serve(&url("index.html").to_string(), StoredResponse::html("index.html fresh"));

    let served = respond(manager.handle_fetch(&Request::navigate(url("index.html"))).await.unwrap());
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.body.as_ref(), b"index.html fresh");

    let stored = manager
      .storage()
      .get("timetable-v1", &RequestKey::get(&url("index.html")))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(stored.body.as_ref(), b"index.html fresh");
  }

  #[tokio::test]
  async fn test_network_first_offline_prefers_exact_entry() {
    let manager = manager("network-first");
    manager.start().await.unwrap();
    manager.network().set_offline(true);

    let exact = respond(manager.handle_fetch(&Request::navigate(url("index.html"))).await.unwrap());
    assert_eq!(exact.source, ResponseSource::Cache);
    assert_eq!(exact.response.body.as_ref(), b"index.html v1");

    let other = respond(manager.handle_fetch(&Request::navigate(url("about.html"))).await.unwrap());
    assert_eq!(other.source, ResponseSource::OfflinePage);
  }

  #[tokio::test]
  async fn test_network_first_subresources_are_cache_first_without_substitution() {
    let manager = manager("network-first");
    manager.start().await.unwrap();
    let calls = manager.network().calls();

    let css = respond(manager.handle_fetch(&Request::get(url("styles.css"))).await.unwrap());
    assert_eq!(css.source, ResponseSource::Cache);
    assert_eq!(manager.network().calls(), calls);

    manager.network().set_offline(true);
    assert!(manager.handle_fetch(&Request::get(url("icons/icon.png"))).await.is_err());
  }

  #[tokio::test]
  async fn test_storage_failure_degrades_to_network_then_offline_notice() {
    let storage = Arc::new(FlakyStorage::default());
    let manager = manager_with("v1", "cache-first", Arc::clone(&storage));
    manager.start().await.unwrap();
    storage.fail_reads.store(true, Ordering::SeqCst);

    let online = respond(manager.handle_fetch(&Request::get(url("styles.css"))).await.unwrap());
    assert_eq!(online.source, ResponseSource::Network);

    manager.network().set_offline(true);
    let offline = respond(manager.handle_fetch(&Request::navigate(url("index.html"))).await.unwrap());
    assert_eq!(offline.source, ResponseSource::Synthesized);
    assert_eq!(offline.response.status, 503);
  }

  #[tokio::test]
  async fn test_concurrent_requests_share_bucket() {
    let manager = manager("cache-first");
    manager.start().await.unwrap();

    let handles: Vec<_> = (0..8)
      .map(|_| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.handle_fetch(&Request::get(url("app.js"))).await })
      })
      .collect();

    for handle in handles {
      let served = respond(handle.await.unwrap().unwrap());
      assert_eq!(served.response.status, 200);
    }
    let keys = manager.storage().keys("timetable-v1").await.unwrap();
    assert_eq!(keys.iter().filter(|k| **k == RequestKey::get(&url("app.js"))).count(), 1);
  }
}
