//! In-process registry of keys that currently have work in flight.
//!
//! Task runs lock `task:<name>` and regional fetches lock
//! `scan:<bbox>:<layer>`. Acquisition never waits: a busy key is reported to
//! the caller, who may poll again later. The registry is handed around by
//! handle so it can be replaced by a shared lock when several instances write
//! to one store.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Held = HashMap<String, DateTime<Utc>>;

#[derive(Clone, Default)]
pub struct RunRegistry {
  held: Arc<Mutex<Held>>,
}

impl RunRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Held> {
    // a panic while holding the map cannot leave it half-written
    self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Claims `key`, or returns `None` when someone else holds it.
  pub fn try_acquire(&self, key: impl Into<String>) -> Option<RunGuard> {
    let key = key.into();
    let mut held = self.lock();
    if held.contains_key(&key) {
      return None;
    }
    held.insert(key.clone(), Utc::now());
    Some(RunGuard { key, held: self.held.clone() })
  }

  pub fn is_held(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }

  /// Keys in flight with the time they were claimed, oldest first.
  pub fn held(&self) -> Vec<(String, DateTime<Utc>)> {
    let mut entries: Vec<(String, DateTime<Utc>)> = self.lock().iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    entries
  }
}

/// Releases its key when dropped, including when the owning future is
/// cancelled by a timeout.
#[derive(Debug)]
pub struct RunGuard {
  key: String,
  held: Arc<Mutex<Held>>,
}

impl RunGuard {
  pub fn key(&self) -> &str {
    &self.key
  }
}

impl Drop for RunGuard {
  fn drop(&mut self) {
    let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    held.remove(&self.key);
  }
}
