//! Handle to a single named cache bucket.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::traits::{CacheStorage, CachedEntry};
use crate::net::{Fetcher, Request, Response};

/// A named bucket within a cache storage backend.
///
/// Cheap to clone; clones share the backend.
pub struct Bucket<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
}

impl<S: CacheStorage> Bucket<S> {
  /// Refer to the bucket `name`. Nothing is created until [`Bucket::open`]
  /// or the first write.
  pub fn new(storage: Arc<S>, name: impl Into<String>) -> Self {
    Self {
      storage,
      name: name.into(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Create the bucket if it does not exist yet. Returns true if it was created.
  pub fn open(&self) -> Result<bool> {
    let created = self.storage.open(&self.name)?;
    if created {
      debug!(bucket = %self.name, "Created cache bucket");
    }
    Ok(created)
  }

  pub fn match_request(&self, request: &Request) -> Result<Option<CachedEntry>> {
    self.storage.match_request(&self.name, request)
  }

  /// Store one entry. Returns false if the bucket no longer exists.
  pub fn put(&self, request: &Request, response: &Response) -> Result<bool> {
    self.storage.put(&self.name, request, response)
  }

  /// Cached URLs, in insertion order.
  #[cfg(test)]
  pub fn keys(&self) -> Result<Vec<String>> {
    self.storage.entry_urls(&self.name)
  }

  /// Fetch every URL and store all responses, or store nothing.
  ///
  /// Fails if a URL appears twice, if any fetch fails, or if any response
  /// has a non-2xx status.
  pub async fn add_all(&self, fetcher: &dyn Fetcher, urls: &[Url]) -> Result<()> {
    let mut seen = HashSet::new();
    for url in urls {
      if !seen.insert(url.as_str()) {
        return Err(eyre!("Duplicate URL in pre-cache list: {}", url));
      }
    }

    let requests: Vec<Request> = urls.iter().cloned().map(Request::get).collect();

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = fetcher
        .fetch(request)
        .await
        .map_err(|e| eyre!("Failed to pre-cache {}: {}", request.url, e))?;

      if !response.status.is_success() {
        return Err(eyre!(
          "Failed to pre-cache {}: upstream returned {}",
          request.url,
          response.status
        ));
      }

      Ok(response)
    }))
    .await?;

    let entries: Vec<(Request, Response)> = requests.into_iter().zip(responses).collect();
    self.storage.put_all(&self.name, &entries)?;

    debug!(bucket = %self.name, count = entries.len(), "Pre-cached URLs");
    Ok(())
  }
}

impl<S: CacheStorage> Clone for Bucket<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      name: self.name.clone(),
    }
  }
}
