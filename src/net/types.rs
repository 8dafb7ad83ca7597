//! Owned request and response values.
//!
//! Bodies are read once into a `Bytes` buffer, so a response can be handed
//! to the caller and to the cache at the same time by cloning it.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, VARY};
use reqwest::{Method, StatusCode};
use url::Url;

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      body: Bytes::new(),
    }
  }

  /// Create a bodiless GET request.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// URL used as the cache key (fragment stripped).
  pub fn cache_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }
}

/// A complete response snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: StatusCode,
  /// Final URL after redirects, if the response came from the network
  pub url: Option<Url>,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: StatusCode) -> Self {
    Self {
      status,
      url: None,
      headers: HeaderMap::new(),
      body: Bytes::new(),
    }
  }

  /// Create a `text/plain` response.
  pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
    let mut response = Self::new(status).with_body(body);
    response
      .headers
      .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  /// Header names listed in `Vary`, lowercased.
  pub fn vary(&self) -> Vec<String> {
    self
      .headers
      .get_all(VARY)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .map(|name| name.trim().to_ascii_lowercase())
      .filter(|name| !name.is_empty())
      .collect()
  }
}

#[cfg(test)]
impl Request {
  pub fn with_header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }
}

#[cfg(test)]
impl Response {
  pub fn with_header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
  }
}
