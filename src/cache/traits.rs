//! Core traits and types for the cache bucket store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

use crate::net::{Request, Response};

/// A cached response together with its metadata.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Name and size of a cache bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSummary {
  pub name: String,
  pub entries: usize,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named buckets, each mapping requests to
/// response snapshots. Writes to a single backend are serialized.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist. Returns true if it was created.
  fn open(&self, bucket: &str) -> Result<bool>;

  /// Names of all existing buckets, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a bucket and all of its entries. Returns true if it existed.
  fn delete(&self, bucket: &str) -> Result<bool>;

  /// Find the entry matching `request` in `bucket`.
  fn match_request(&self, bucket: &str, request: &Request) -> Result<Option<CachedEntry>>;

  /// Store a single entry in an existing bucket.
  ///
  /// Returns false without storing anything if the bucket was never opened
  /// or has been deleted since.
  fn put(&self, bucket: &str, request: &Request, response: &Response) -> Result<bool>;

  /// Store every entry or none of them, creating the bucket if needed.
  fn put_all(&self, bucket: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Cached URLs in `bucket`, in insertion order.
  fn entry_urls(&self, bucket: &str) -> Result<Vec<String>>;

  /// Every bucket with its entry count, oldest first.
  fn summaries(&self) -> Result<Vec<BucketSummary>>;
}

/// Reject pairs the Cache API refuses to store.
pub fn check_storable(request: &Request, response: &Response) -> Result<()> {
  if !request.is_get() {
    return Err(eyre!(
      "Cannot cache {} request for {}",
      request.method,
      request.url
    ));
  }

  if response.status == StatusCode::PARTIAL_CONTENT {
    return Err(eyre!("Cannot cache partial response for {}", request.url));
  }

  if response.vary().iter().any(|name| name == "*") {
    return Err(eyre!("Cannot cache response with 'Vary: *' for {}", request.url));
  }

  Ok(())
}

/// Check the `Vary` headers of a stored response against a new request.
///
/// `stored` holds the request headers captured when the entry was written.
pub fn vary_matches(stored: &HeaderMap, response: &Response, request: &Request) -> bool {
  let names = response.vary();
  if names.iter().any(|name| name == "*") {
    return false;
  }

  names
    .iter()
    .all(|name| request.headers.get(name.as_str()) == stored.get(name.as_str()))
}

/// Request headers worth storing alongside a response: those it varies on.
pub fn varied_headers(request: &Request, response: &Response) -> HeaderMap {
  let mut out = HeaderMap::new();
  for name in response.vary() {
    for value in request.headers.get_all(name.as_str()) {
      if let Ok(header_name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) {
        out.append(header_name, value.clone());
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::{HeaderValue, ACCEPT_ENCODING, VARY};
  use reqwest::Method;
  use url::Url;

  fn request(path: &str) -> Request {
    Request::get(Url::parse("http://app.local/").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_check_storable_rejects_non_get() {
    let mut req = request("/api/items");
    req.method = Method::POST;
    assert!(check_storable(&req, &Response::new(StatusCode::OK)).is_err());
  }

  #[test]
  fn test_check_storable_rejects_partial_content() {
    let res = Response::new(StatusCode::PARTIAL_CONTENT);
    assert!(check_storable(&request("/video.mp4"), &res).is_err());
  }

  #[test]
  fn test_check_storable_accepts_error_status() {
    let res = Response::new(StatusCode::NOT_FOUND);
    assert!(check_storable(&request("/missing"), &res).is_ok());
  }

  #[test]
  fn test_vary_star_never_matches() {
    let res = Response::new(StatusCode::OK).with_header(VARY, HeaderValue::from_static("*"));
    assert!(!vary_matches(&HeaderMap::new(), &res, &request("/")));
    assert!(check_storable(&request("/"), &res).is_err());
  }

  #[test]
  fn test_vary_compares_named_headers() {
    let res =
      Response::new(StatusCode::OK).with_header(VARY, HeaderValue::from_static("Accept-Encoding"));
    let gzip = request("/app.js").with_header(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    let stored = varied_headers(&gzip, &res);

    assert!(vary_matches(&stored, &res, &gzip));

    let br = request("/app.js").with_header(ACCEPT_ENCODING, HeaderValue::from_static("br"));
    assert!(!vary_matches(&stored, &res, &br));
    assert!(!vary_matches(&stored, &res, &request("/app.js")));
  }

  #[test]
  fn test_no_vary_always_matches() {
    let res = Response::new(StatusCode::OK);
    let req = request("/").with_header(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    assert!(vary_matches(&HeaderMap::new(), &res, &req));
  }
}
