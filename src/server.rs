//! HTTP front end: every request is intercepted and handed to the worker host.

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::net::{forwardable_headers, Request, Response};
use crate::worker::WorkerHost;

/// Header a page can set to identify its client session.
pub const CLIENT_HEADER: &str = "x-offcache-client";

/// Longer client ids are ignored in favour of the peer address.
const MAX_CLIENT_ID_LEN: usize = 128;

/// Shared state for the intercepting handler.
pub struct ProxyState<S: CacheStorage> {
  pub host: Arc<WorkerHost<S>>,
  pub origin: Url,
  pub max_body_bytes: usize,
}

impl<S: CacheStorage> Clone for ProxyState<S> {
  fn clone(&self) -> Self {
    Self {
      host: Arc::clone(&self.host),
      origin: self.origin.clone(),
      max_body_bytes: self.max_body_bytes,
    }
  }
}

/// Build the router: a single fallback that intercepts every method and path.
pub fn router<S: CacheStorage + 'static>(state: ProxyState<S>) -> Router {
  Router::new()
    .fallback(intercept::<S>)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Serve until Ctrl-C, then wait for pending cache writes.
pub async fn serve<S: CacheStorage + 'static>(
  state: ProxyState<S>,
  listen: SocketAddr,
) -> Result<()> {
  let host = Arc::clone(&state.host);
  let app = router(state);

  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(%listen, "Listening");

  axum::serve(
    listener,
    app.into_make_service_with_connect_info::<SocketAddr>(),
  )
  .with_graceful_shutdown(shutdown_signal())
  .await
  .map_err(|e| eyre!("Server error: {}", e))?;

  host.settle().await;
  info!("Shut down");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "Failed to listen for Ctrl-C");
    std::future::pending::<()>().await;
  }
}

async fn intercept<S: CacheStorage + 'static>(
  State(state): State<ProxyState<S>>,
  request: axum::extract::Request,
) -> HttpResponse {
  let client = client_id(&request);
  let (parts, body) = request.into_parts();

  let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
    Ok(body) => body,
    Err(e) => {
      warn!(uri = %parts.uri, error = %e, "Rejected request body");
      return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
    }
  };

  let url = match resolve(&state.origin, &parts.uri) {
    Ok(url) => url,
    Err(e) => {
      warn!(uri = %parts.uri, error = %e, "Rejected request URI");
      return (StatusCode::BAD_REQUEST, "Bad request URI").into_response();
    }
  };

  let request = Request {
    method: parts.method,
    url,
    headers: forwardable_headers(&parts.headers),
    body,
  };

  match state.host.dispatch_fetch(&client, request).await {
    Ok(response) => into_http(response),
    Err(e) => {
      warn!(client = %client, error = %e, "Upstream unavailable");
      into_http(Response::text(StatusCode::BAD_GATEWAY, "Bad Gateway"))
    }
  }
}

/// Client session id: the explicit header, else the peer IP.
fn client_id(request: &axum::extract::Request) -> String {
  if let Some(id) = request
    .headers()
    .get(CLIENT_HEADER)
    .and_then(|v| v.to_str().ok())
    .filter(|v| !v.is_empty() && v.len() <= MAX_CLIENT_ID_LEN)
  {
    return id.to_string();
  }

  request
    .extensions()
    .get::<ConnectInfo<SocketAddr>>()
    .map(|ConnectInfo(addr)| addr.ip().to_string())
    .unwrap_or_else(|| "anonymous".to_string())
}

/// Map a proxied path onto the upstream origin.
///
/// Only the path and query of `uri` are used; a target that would still
/// leave the upstream origin is rejected.
fn resolve(origin: &Url, uri: &Uri) -> Result<Url> {
  let mut url = origin.clone();
  url.set_path(uri.path());
  url.set_query(uri.query());

  if url.origin() != origin.origin() {
    return Err(eyre!("{} escapes upstream origin {}", uri, origin));
  }

  Ok(url)
}

fn into_http(response: Response) -> HttpResponse {
  let mut out = HttpResponse::new(Body::from(response.body));
  *out.status_mut() = response.status;
  *out.headers_mut() = forwardable_headers(&response.headers);
  out
}
