//! Host runtime that installs, activates and routes requests to workers.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::lifecycle::{Clients, WorkerScope, WorkerState};
use super::OfflineCacheWorker;
use crate::cache::CacheStorage;
use crate::net::{Fetcher, Request, Response};

/// Outcome of registering a new worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
  pub version: String,
  /// Stale buckets removed during activation
  pub deleted: Vec<String>,
  pub skipped_waiting: bool,
  pub claimed_clients: bool,
}

/// Owns the active worker and the set of client sessions.
///
/// Requests are only routed to a worker once it has finished installing
/// and activating. A failed install leaves the previous worker in place.
pub struct WorkerHost<S: CacheStorage> {
  active: RwLock<Option<Arc<OfflineCacheWorker<S>>>>,
  clients: Clients,
  /// Used for clients no worker controls
  network: Arc<dyn Fetcher>,
}

impl<S: CacheStorage + 'static> WorkerHost<S> {
  pub fn new(network: Arc<dyn Fetcher>) -> Self {
    Self {
      active: RwLock::new(None),
      clients: Clients::new(),
      network,
    }
  }

  #[cfg(test)]
  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn active(&self) -> Option<Arc<OfflineCacheWorker<S>>> {
    self
      .active
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  #[cfg(test)]
  pub fn active_version(&self) -> Option<String> {
    self.active().map(|worker| worker.version().to_string())
  }

  /// Install `worker` and, if that succeeds, activate it.
  ///
  /// On install failure the worker becomes redundant, the currently active
  /// worker (if any) keeps serving, and the install error is returned.
  pub async fn register(&self, worker: Arc<OfflineCacheWorker<S>>) -> Result<Registration> {
    worker.transition(WorkerState::Installing)?;

    let scope = WorkerScope::new(worker.version(), &self.clients);
    if let Err(e) = worker.install(&scope).await {
      warn!(version = %worker.version(), error = %e, "Install failed, keeping previous version");
      worker.transition(WorkerState::Redundant)?;
      return Err(e);
    }
    worker.transition(WorkerState::Installed)?;

    // Every worker asks to skip waiting, so activation follows install directly
    let skipped_waiting = scope.skip_waiting_requested();
    if !skipped_waiting {
      debug!(version = %worker.version(), "Worker did not ask to skip waiting");
    }

    let mut registration = self.activate(Arc::clone(&worker)).await?;
    registration.skipped_waiting = skipped_waiting;
    Ok(registration)
  }

  async fn activate(&self, worker: Arc<OfflineCacheWorker<S>>) -> Result<Registration> {
    let previous = self.active();

    // Let the old worker finish its pending cache writes. Responses it is
    // still waiting on land after the delete and find no bucket to write to
    if let Some(previous) = &previous {
      previous.settle().await;
    }

    worker.transition(WorkerState::Activating)?;

    let scope = WorkerScope::new(worker.version(), &self.clients);
    let deleted = match worker.activate(&scope).await {
      Ok(deleted) => deleted,
      Err(e) => {
        warn!(version = %worker.version(), error = %e, "Stale cache cleanup failed");
        Vec::new()
      }
    };

    {
      let mut active = self
        .active
        .write()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      *active = Some(Arc::clone(&worker));
    }

    if let Some(previous) = previous {
      self.clients.hand_over(previous.version(), worker.version());
      if previous.state() != WorkerState::Redundant {
        previous.transition(WorkerState::Redundant)?;
      }
    }

    worker.transition(WorkerState::Activated)?;

    info!(
      version = %worker.version(),
      deleted = deleted.len(),
      clients = self.clients.count(),
      "Worker activated"
    );

    Ok(Registration {
      version: worker.version().to_string(),
      deleted,
      skipped_waiting: false,
      claimed_clients: scope.clients_claimed(),
    })
  }

  /// Route a request from `client` through the worker controlling it.
  ///
  /// Requests from uncontrolled clients, or made while no worker is active,
  /// go straight to the network; only those can fail.
  pub async fn dispatch_fetch(&self, client: &str, request: Request) -> Result<Response> {
    let active = self.active();
    let controller = self
      .clients
      .attach(client, active.as_ref().map(|worker| worker.version()));

    match (active, controller) {
      (Some(worker), Some(_)) => Ok(worker.handle_fetch(request).await),
      _ => {
        debug!(client, url = %request.url, "Uncontrolled client, bypassing cache");
        self.network.fetch(&request).await
      }
    }
  }

  /// Wait for the active worker's background cache writes.
  pub async fn settle(&self) {
    if let Some(worker) = self.active() {
      worker.settle().await;
    }
  }
}
