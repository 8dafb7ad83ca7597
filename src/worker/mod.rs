//! The offline cache worker and the host that drives it.
//!
//! The worker owns one cache bucket named after its version and handles
//! three events:
//! - install: pre-cache a fixed list of URLs, all or nothing
//! - activate: delete every bucket from other versions, claim clients
//! - fetch: cache first, then network (populating the cache), then an
//!   offline fallback

mod host;
mod lifecycle;

pub use host::WorkerHost;
pub use lifecycle::{WorkerScope, WorkerState};

use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use std::sync::{Arc, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{Bucket, CacheStorage};
use crate::net::{Fetcher, Request, Response};

/// Body of the response served when neither cache nor network can answer.
pub const OFFLINE_BODY: &str = "Offline - Check connection.";

/// Values fixed for the lifetime of a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  /// Cache bucket name; bump it on every deployment that changes cached content
  pub version: String,
  /// Upstream origin; the root document is `/` on this origin
  pub origin: Url,
  /// Absolute URLs fetched and stored on install
  pub precache: Vec<Url>,
}

/// Cache-first offline worker for one deployed version.
pub struct OfflineCacheWorker<S: CacheStorage> {
  settings: WorkerSettings,
  bucket: Bucket<S>,
  fetcher: Arc<dyn Fetcher>,
  state: RwLock<WorkerState>,
  /// Detached cache writes started by fetch handling
  background: TaskTracker,
}

impl<S: CacheStorage + 'static> OfflineCacheWorker<S> {
  pub fn new(settings: WorkerSettings, storage: Arc<S>, fetcher: Arc<dyn Fetcher>) -> Self {
    let bucket = Bucket::new(storage, settings.version.clone());

    Self {
      settings,
      bucket,
      fetcher,
      state: RwLock::new(WorkerState::Parsed),
      background: TaskTracker::new(),
    }
  }

  pub fn version(&self) -> &str {
    &self.settings.version
  }

  #[cfg(test)]
  pub fn bucket(&self) -> &Bucket<S> {
    &self.bucket
  }

  pub fn state(&self) -> WorkerState {
    *self
      .state
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Move to `next`, rejecting transitions the lifecycle does not allow.
  pub(crate) fn transition(&self, next: WorkerState) -> Result<()> {
    let mut state = self
      .state
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if !state.can_transition_to(next) {
      return Err(eyre!(
        "Worker {} cannot move from {} to {}",
        self.settings.version,
        *state,
        next
      ));
    }

    let from = *state;
    debug!(version = %self.settings.version, %from, to = %next, "Worker state change");
    *state = next;
    Ok(())
  }

  /// Install handler: open the bucket and pre-cache every configured URL.
  ///
  /// One unfetchable URL fails the whole install and nothing is stored. A
  /// bucket created by a failed install is removed again.
  pub async fn install(&self, scope: &WorkerScope<'_>) -> Result<()> {
    info!(
      version = %self.settings.version,
      urls = self.settings.precache.len(),
      "Installing"
    );

    scope.skip_waiting();

    let created = self.bucket.open()?;
    let result = self
      .bucket
      .add_all(self.fetcher.as_ref(), &self.settings.precache)
      .await;

    if result.is_err() && created {
      if let Err(e) = self.bucket.storage().delete(self.bucket.name()) {
        warn!(bucket = %self.bucket.name(), error = %e, "Failed to remove bucket of failed install");
      }
    }

    result
  }

  /// Activate handler: delete stale buckets and claim open clients.
  ///
  /// Deletions are independent; a failed one is logged and the rest still
  /// run. Returns the names of the buckets that were deleted.
  pub async fn activate(&self, scope: &WorkerScope<'_>) -> Result<Vec<String>> {
    let cleanup = self.delete_stale_buckets();
    let claimed = scope.claim_clients();
    debug!(version = %self.settings.version, claimed, "Claimed clients");
    cleanup
  }

  fn delete_stale_buckets(&self) -> Result<Vec<String>> {
    let storage = self.bucket.storage();
    let mut deleted = Vec::new();

    for name in storage.keys()? {
      if name == self.settings.version {
        continue;
      }

      match storage.delete(&name) {
        Ok(_) => {
          info!(bucket = %name, "Deleted stale cache bucket");
          deleted.push(name);
        }
        Err(e) => warn!(bucket = %name, error = %e, "Failed to delete stale cache bucket"),
      }
    }

    Ok(deleted)
  }

  /// Fetch handler: cache first, then network, then offline fallback.
  ///
  /// Never fails; every error is recovered into some response.
  pub async fn handle_fetch(&self, request: Request) -> Response {
    match self.bucket.match_request(&request) {
      Ok(Some(entry)) => {
        debug!(url = %request.url, cached_at = %entry.cached_at, "Cache hit");
        return entry.response;
      }
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "Cache lookup failed"),
    }

    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        if request.is_get() {
          self.populate(request, response.clone());
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network unavailable, serving offline fallback");
        self.offline_fallback()
      }
    }
  }

  /// Store a network response without making the caller wait for it.
  ///
  /// A response that arrives after the bucket was deleted (this version was
  /// replaced while the request was in flight) is dropped.
  fn populate(&self, request: Request, response: Response) {
    let bucket = self.bucket.clone();

    self.background.spawn_blocking(move || match bucket.put(&request, &response) {
      Ok(true) => {}
      Ok(false) => debug!(url = %request.url, bucket = %bucket.name(), "Bucket gone, dropped response"),
      Err(e) => debug!(url = %request.url, error = %e, "Skipped caching response"),
    });
  }

  /// The cached root document, or a fixed plaintext notice.
  fn offline_fallback(&self) -> Response {
    let root_url = self
      .settings
      .origin
      .join("/")
      .unwrap_or_else(|_| self.settings.origin.clone());
    let root = Request::get(root_url);

    match self.bucket.match_request(&root) {
      Ok(Some(entry)) => entry.response,
      Ok(None) => offline_response(),
      Err(e) => {
        warn!(error = %e, "Cache lookup for root document failed");
        offline_response()
      }
    }
  }

  /// Wait for every background cache write started so far.
  pub async fn settle(&self) {
    self.background.close();
    self.background.wait().await;
    self.background.reopen();
  }
}

/// Served when both cache and network fail.
pub fn offline_response() -> Response {
  Response::text(StatusCode::OK, OFFLINE_BODY)
}

#[cfg(test)]
mod tests {
  use super::lifecycle::Clients;
  use super::*;
  use crate::cache::{BucketSummary, CachedEntry, SqliteStorage};
  use crate::net::testing::ScriptedFetcher;
  use reqwest::header::{HeaderValue, CONTENT_TYPE};
  use reqwest::Method;

  const ORIGIN: &str = "http://app.local";

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn html(body: &'static str) -> Response {
    Response::new(StatusCode::OK)
      .with_header(CONTENT_TYPE, HeaderValue::from_static("text/html"))
      .with_body(body)
  }

  fn seed(storage: &SqliteStorage, bucket: &str, path: &str, response: &Response) {
    storage.open(bucket).unwrap();
    assert!(storage.put(bucket, &Request::get(url(path)), response).unwrap());
  }

  struct Fixture {
    storage: Arc<SqliteStorage>,
    fetcher: Arc<ScriptedFetcher>,
    clients: Clients,
  }

  impl Fixture {
    fn new() -> Self {
      Self {
        storage: Arc::new(SqliteStorage::open_in_memory().unwrap()),
        fetcher: Arc::new(ScriptedFetcher::new()),
        clients: Clients::new(),
      }
    }

    fn worker(&self, version: &str, precache: &[&str]) -> OfflineCacheWorker<SqliteStorage> {
      let settings = WorkerSettings {
        version: version.to_string(),
        origin: Url::parse(ORIGIN).unwrap(),
        precache: precache.iter().map(|p| url(p)).collect(),
      };
      OfflineCacheWorker::new(settings, self.storage.clone(), self.fetcher.clone())
    }
  }

  #[tokio::test]
  async fn test_install_precaches_exactly_the_list() {
    let fx = Fixture::new();
    fx.fetcher.route("http://app.local/", html("root"));
    fx.fetcher.route("http://app.local/manifest.json", html("{}"));

    let worker = fx.worker("v1", &["/", "/manifest.json"]);
    let scope = WorkerScope::new("v1", &fx.clients);
    worker.install(&scope).await.unwrap();

    assert!(scope.skip_waiting_requested());
    assert_eq!(
      worker.bucket().keys().unwrap(),
      vec!["http://app.local/", "http://app.local/manifest.json"]
    );
  }

  #[tokio::test]
  async fn test_install_fails_on_one_bad_url() {
    let fx = Fixture::new();
    fx.fetcher.route("http://app.local/", html("root"));

    let worker = fx.worker("v1", &["/", "/missing.css"]);
    let scope = WorkerScope::new("v1", &fx.clients);

    assert!(worker.install(&scope).await.is_err());
    assert!(worker.bucket().keys().unwrap().is_empty());
    assert!(fx.storage.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_deletes_other_versions() {
    let fx = Fixture::new();
    seed(&fx.storage, "v0", "/", &html("old"));
    seed(&fx.storage, "v1", "/", &html("current"));
    seed(&fx.storage, "scratch", "/", &html("other"));

    let worker = fx.worker("v1", &[]);
    let scope = WorkerScope::new("v1", &fx.clients);
    let deleted = worker.activate(&scope).await.unwrap();

    assert_eq!(deleted, vec!["v0", "scratch"]);
    assert_eq!(fx.storage.keys().unwrap(), vec!["v1"]);
    assert!(scope.clients_claimed());
  }

  /// SQLite storage whose `delete` fails for one bucket name.
  struct StuckBucket {
    inner: SqliteStorage,
    stuck: &'static str,
  }

  impl CacheStorage for StuckBucket {
    fn open(&self, bucket: &str) -> Result<bool> {
      self.inner.open(bucket)
    }

    fn keys(&self) -> Result<Vec<String>> {
      self.inner.keys()
    }

    fn delete(&self, bucket: &str) -> Result<bool> {
      if bucket == self.stuck {
        return Err(eyre!("database is locked"));
      }
      self.inner.delete(bucket)
    }

    fn match_request(&self, bucket: &str, request: &Request) -> Result<Option<CachedEntry>> {
      self.inner.match_request(bucket, request)
    }

    fn put(&self, bucket: &str, request: &Request, response: &Response) -> Result<bool> {
      self.inner.put(bucket, request, response)
    }

    fn put_all(&self, bucket: &str, entries: &[(Request, Response)]) -> Result<()> {
      self.inner.put_all(bucket, entries)
    }

    fn entry_urls(&self, bucket: &str) -> Result<Vec<String>> {
      self.inner.entry_urls(bucket)
    }

    fn summaries(&self) -> Result<Vec<BucketSummary>> {
      self.inner.summaries()
    }
  }

  #[tokio::test]
  async fn test_activate_continues_past_failed_delete() {
    let inner = SqliteStorage::open_in_memory().unwrap();
    for name in ["v0", "stuck", "v0-beta", "v1"] {
      seed(&inner, name, "/", &html(""));
    }
    let storage = Arc::new(StuckBucket {
      inner,
      stuck: "stuck",
    });
    let settings = WorkerSettings {
      version: "v1".to_string(),
      origin: Url::parse(ORIGIN).unwrap(),
      precache: Vec::new(),
    };
    let worker = OfflineCacheWorker::new(settings, storage.clone(), Arc::new(ScriptedFetcher::new()));
    let clients = Clients::new();
    let scope = WorkerScope::new("v1", &clients);

    let deleted = worker.activate(&scope).await.unwrap();

    assert_eq!(deleted, vec!["v0", "v0-beta"]);
    assert_eq!(storage.keys().unwrap(), vec!["stuck", "v1"]);
    assert!(scope.clients_claimed());
  }

  #[tokio::test]
  async fn test_cache_hit_skips_network() {
    let fx = Fixture::new();
    let cached = html("from cache");
    seed(&fx.storage, "v1", "/page", &cached);
    fx.fetcher.route("http://app.local/page", html("from network"));

    let worker = fx.worker("v1", &[]);
    let response = worker.handle_fetch(Request::get(url("/page"))).await;

    assert_eq!(response, cached);
    assert_eq!(fx.fetcher.call_count(), 0);
  }

  #[tokio::test]
  async fn test_miss_fetches_and_populates_cache() {
    let fx = Fixture::new();
    let network = html("fresh");
    fx.fetcher.route("http://app.local/news", network.clone());

    let worker = fx.worker("v1", &[]);
    worker.bucket().open().unwrap();
    let response = worker.handle_fetch(Request::get(url("/news"))).await;
    assert_eq!(response, network);

    worker.settle().await;

    let entry = worker
      .bucket()
      .match_request(&Request::get(url("/news")))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response, network);
  }

  #[tokio::test]
  async fn test_non_get_is_not_cached() {
    let fx = Fixture::new();
    let network = Response::text(StatusCode::CREATED, "saved");
    fx.fetcher.route("http://app.local/api/items", network.clone());

    let worker = fx.worker("v1", &[]);
    worker.bucket().open().unwrap();
    let request = Request::new(Method::POST, url("/api/items")).with_body("name=x");
    let response = worker.handle_fetch(request).await;
    worker.settle().await;

    assert_eq!(response, network);
    assert!(worker.bucket().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_uncacheable_response_still_returned() {
    let fx = Fixture::new();
    let partial = Response::new(StatusCode::PARTIAL_CONTENT).with_body("part");
    fx.fetcher.route("http://app.local/video.mp4", partial.clone());

    let worker = fx.worker("v1", &[]);
    worker.bucket().open().unwrap();
    let response = worker.handle_fetch(Request::get(url("/video.mp4"))).await;
    worker.settle().await;

    assert_eq!(response, partial);
    assert!(worker.bucket().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_serves_cached_root() {
    let fx = Fixture::new();
    let root = html("app shell");
    seed(&fx.storage, "v1", "/", &root);
    fx.fetcher.set_offline(true);

    let worker = fx.worker("v1", &[]);
    let response = worker.handle_fetch(Request::get(url("/reports/7"))).await;

    assert_eq!(response, root);
  }

  #[tokio::test]
  async fn test_offline_without_root_serves_notice() {
    let fx = Fixture::new();
    fx.fetcher.set_offline(true);

    let worker = fx.worker("v1", &[]);
    let response = worker
      .handle_fetch(Request::new(Method::POST, url("/api/items")))
      .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.content_type(), Some("text/plain"));
    assert_eq!(response.body, OFFLINE_BODY);
  }

  #[tokio::test]
  async fn test_root_from_other_version_is_ignored() {
    let fx = Fixture::new();
    seed(&fx.storage, "v0", "/", &html("old shell"));
    fx.fetcher.set_offline(true);

    let worker = fx.worker("v1", &[]);
    let response = worker.handle_fetch(Request::get(url("/"))).await;

    assert_eq!(response, offline_response());
  }

  #[test]
  fn test_transition_rejects_skipping_install() {
    let fx = Fixture::new();
    let worker = fx.worker("v1", &[]);
    assert!(worker.transition(WorkerState::Activated).is_err());
    worker.transition(WorkerState::Installing).unwrap();
    assert_eq!(worker.state(), WorkerState::Installing);
  }
}
