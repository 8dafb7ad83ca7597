//! Worker lifecycle states and the scope handed to lifecycle handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Lifecycle state of a worker, driven by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Constructed, not yet installing
  Parsed,
  Installing,
  Installed,
  Activating,
  /// Serving requests
  Activated,
  /// Failed to install, or replaced by a newer version
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }

  /// Whether the host may move a worker from `self` to `next`.
  pub fn can_transition_to(self, next: WorkerState) -> bool {
    use WorkerState::*;

    match (self, next) {
      (Parsed, Installing)
      | (Installing, Installed)
      | (Installed, Activating)
      | (Activating, Activated) => true,
      (Redundant, _) => false,
      (_, Redundant) => true,
      _ => false,
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Most client sessions remembered at once.
pub const MAX_CLIENTS: usize = 4096;

#[derive(Debug)]
struct Session {
  controller: Option<String>,
  last_seen: u64,
}

#[derive(Debug, Default)]
struct Registry {
  sessions: HashMap<String, Session>,
  clock: u64,
}

impl Registry {
  fn evict_least_recent(&mut self) {
    let oldest = self
      .sessions
      .iter()
      .min_by_key(|(_, session)| session.last_seen)
      .map(|(id, _)| id.clone());

    if let Some(id) = oldest {
      self.sessions.remove(&id);
    }
  }
}

/// Client sessions seen by the host and the version controlling each.
///
/// A client first seen while no worker is active stays uncontrolled (its
/// requests bypass the cache) until a worker claims it. At most `limit`
/// sessions are kept; the least recently seen one is forgotten first and is
/// treated as new if it comes back.
#[derive(Debug)]
pub struct Clients {
  registry: Mutex<Registry>,
  limit: usize,
}

impl Default for Clients {
  fn default() -> Self {
    Self::with_limit(MAX_CLIENTS)
  }
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_limit(limit: usize) -> Self {
    Self {
      registry: Mutex::new(Registry::default()),
      limit: limit.max(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Registry> {
    self
      .registry
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Record `client` if it is new, controlled by `active`. Returns the
  /// version currently controlling it.
  pub fn attach(&self, client: &str, active: Option<&str>) -> Option<String> {
    let mut registry = self.lock();
    registry.clock += 1;
    let now = registry.clock;

    if let Some(session) = registry.sessions.get_mut(client) {
      session.last_seen = now;
      return session.controller.clone();
    }

    if registry.sessions.len() >= self.limit {
      registry.evict_least_recent();
    }

    let controller = active.map(String::from);
    registry.sessions.insert(
      client.to_string(),
      Session {
        controller: controller.clone(),
        last_seen: now,
      },
    );
    controller
  }

  /// Put every known client under `version`. Returns how many changed.
  pub fn claim(&self, version: &str) -> usize {
    let mut registry = self.lock();
    let mut claimed = 0;
    for session in registry.sessions.values_mut() {
      if session.controller.as_deref() != Some(version) {
        session.controller = Some(version.to_string());
        claimed += 1;
      }
    }
    claimed
  }

  /// Move clients controlled by `from` to `to`.
  pub fn hand_over(&self, from: &str, to: &str) {
    for session in self.lock().sessions.values_mut() {
      if session.controller.as_deref() == Some(from) {
        session.controller = Some(to.to_string());
      }
    }
  }

  #[cfg(test)]
  pub fn controller(&self, client: &str) -> Option<String> {
    self
      .lock()
      .sessions
      .get(client)
      .and_then(|session| session.controller.clone())
  }

  /// Number of known client sessions.
  pub fn count(&self) -> usize {
    self.lock().sessions.len()
  }
}

/// What a lifecycle handler may ask of its host.
pub struct WorkerScope<'a> {
  version: &'a str,
  clients: &'a Clients,
  skip_waiting: AtomicBool,
  claimed: AtomicBool,
}

impl<'a> WorkerScope<'a> {
  pub fn new(version: &'a str, clients: &'a Clients) -> Self {
    Self {
      version,
      clients,
      skip_waiting: AtomicBool::new(false),
      claimed: AtomicBool::new(false),
    }
  }

  /// Ask the host to activate this worker as soon as it is installed.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Take control of every open client session.
  pub fn claim_clients(&self) -> usize {
    self.claimed.store(true, Ordering::SeqCst);
    self.clients.claim(self.version)
  }

  pub fn clients_claimed(&self) -> bool {
    self.claimed.load(Ordering::SeqCst)
  }
}
