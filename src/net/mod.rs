//! Request/response values and network fetching.

mod client;
mod types;

pub use client::{Fetcher, UpstreamClient};
pub use types::{Request, Response};

use reqwest::header::{self, HeaderMap, HeaderName};

/// Headers that describe a single connection and must not be relayed.
const HOP_BY_HOP: &[HeaderName] = &[
  header::CONNECTION,
  header::PROXY_AUTHENTICATE,
  header::PROXY_AUTHORIZATION,
  header::TE,
  header::TRAILER,
  header::TRANSFER_ENCODING,
  header::UPGRADE,
  header::HOST,
  header::CONTENT_LENGTH,
];

/// Copy of `headers` without hop-by-hop headers.
///
/// `Host` and `Content-Length` are dropped as well; both are recomputed
/// from the target URL and the buffered body.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
  let mut out = headers.clone();
  for name in HOP_BY_HOP {
    out.remove(name);
  }
  out.remove("keep-alive");
  out
}

#[cfg(test)]
pub mod testing {
  //! Scripted in-process fetcher for tests.

  use std::collections::{HashMap, HashSet};
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  use async_trait::async_trait;
  use color_eyre::{eyre::eyre, Result};
  use reqwest::Method;
  use tokio::sync::Semaphore;

  use super::{Fetcher, Request, Response};

  /// Answers from a fixed routing table and records every call.
  pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Response>>,
    calls: Mutex<Vec<(Method, String)>>,
    offline: AtomicBool,
    held: Mutex<HashSet<String>>,
    gate: Semaphore,
  }

  impl ScriptedFetcher {
    pub fn new() -> Self {
      Self {
        routes: Mutex::new(HashMap::new()),
        calls: Mutex::new(Vec::new()),
        offline: AtomicBool::new(false),
        held: Mutex::new(HashSet::new()),
        gate: Semaphore::new(0),
      }
    }

    /// Serve `response` for `url`. Unrouted URLs fail like a refused connection.
    pub fn route(&self, url: &str, response: Response) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    /// Keep requests for `url` pending until [`ScriptedFetcher::release`].
    pub fn hold(&self, url: &str) {
      self.held.lock().unwrap().insert(url.to_string());
    }

    /// Let one held request through.
    pub fn release(&self) {
      self.gate.add_permits(1);
    }

    pub fn calls(&self) -> Vec<(Method, String)> {
      self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
      self.calls.lock().unwrap().len()
    }
  }

  impl Default for ScriptedFetcher {
    fn default() -> Self {
      Self::new()
    }
  }

  #[async_trait]
  impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      self
        .calls
        .lock()
        .unwrap()
        .push((request.method.clone(), request.url.to_string()));

      let held = self.held.lock().unwrap().contains(request.url.as_str());
      if held {
        let permit = self.gate.acquire().await.map_err(|e| eyre!("{}", e))?;
        permit.forget();
      }

      if self.offline.load(Ordering::SeqCst) {
        return Err(eyre!("network unreachable"));
      }

      self
        .routes
        .lock()
        .unwrap()
        .get(request.url.as_str())
        .cloned()
        .ok_or_else(|| eyre!("connection refused: {}", request.url))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::HeaderValue;

  #[test]
  fn test_forwardable_headers_drops_hop_by_hop() {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
    headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
    headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

    let out = forwardable_headers(&headers);
    assert_eq!(out.len(), 1);
    assert_eq!(out.get(header::ACCEPT).unwrap(), "text/html");
  }
}
