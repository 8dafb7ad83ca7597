//! Network access to the upstream origin.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use super::forwardable_headers;
use super::types::{Request, Response};

/// Anything that can turn a request into a response over the network.
///
/// An `Err` means the request never produced a response (connection
/// refused, DNS failure, timeout). HTTP error statuses are `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed fetcher for the upstream web application.
#[derive(Clone)]
pub struct UpstreamClient {
  client: reqwest::Client,
}

impl UpstreamClient {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for UpstreamClient {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(forwardable_headers(&request.headers));

    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status();
    let url = response.url().clone();
    let headers = forwardable_headers(response.headers());
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?;

    debug!(method = %request.method, url = %request.url, %status, bytes = body.len(), "Upstream responded");

    Ok(Response {
      status,
      url: Some(url),
      headers,
      body,
    })
  }
}
