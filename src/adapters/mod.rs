//! Provider adapters and the lookup table they are registered in.
//!
//! An adapter turns a region (or a named global scope) into normalized
//! [`Measurement`]s. It owns upstream paging, auth and unit conversion; it
//! never deduplicates or persists.

pub mod feed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::AdapterError;
use crate::freshness::FreshnessPolicy;
use crate::models::Measurement;
use crate::region::BoundingBox;

pub use feed::FeedAdapter;

/// Scope scheme used by non-spatial tasks.
pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, PartialEq)]
pub enum RegionSelector {
  Global(String),
  Area { bbox: BoundingBox, zoom: u8 },
}

impl fmt::Display for RegionSelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RegionSelector::Global(scope) => write!(f, "scope:{scope}"),
      RegionSelector::Area { bbox, zoom } => write!(f, "bbox:{bbox}@z{zoom}"),
    }
  }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
  /// Provider key stamped on every measurement this adapter yields.
  fn key(&self) -> &str;

  /// Logical layer the provider feeds (`fires`, `air`, ...).
  fn layer(&self) -> &str;

  async fn fetch(
    &self,
    selector: &RegionSelector,
    since: Option<DateTime<Utc>>,
  ) -> Result<Vec<Measurement>, AdapterError>;
}

/// Calls `adapter` with a hard deadline so a hung upstream cannot hold a lock.
pub async fn fetch_with_timeout(
  adapter: &dyn ProviderAdapter,
  selector: &RegionSelector,
  since: Option<DateTime<Utc>>,
  limit: Duration,
) -> Result<Vec<Measurement>, AdapterError> {
  match timeout(limit, adapter.fetch(selector, since)).await {
    Ok(Ok(records)) => {
      debug!(provider = adapter.key(), selector = %selector, records = records.len(), "Adapter fetch complete");
      Ok(records)
    }
    Ok(Err(e)) => {
      warn!(provider = adapter.key(), selector = %selector, error = %e, "Adapter fetch failed");
      Err(e)
    }
    Err(_) => {
      warn!(provider = adapter.key(), selector = %selector, "Adapter fetch timed out");
      Err(AdapterError::Timeout(limit.as_secs()))
    }
  }
}

/// Explicit table of the adapters available to this process.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
  adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds `adapter`, replacing any adapter already registered under its key.
  pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> &mut Self {
    let key = adapter.key().to_string();
    if self.adapters.insert(key.clone(), adapter).is_some() {
      warn!(provider = %key, "Replaced previously registered adapter");
    }
    self
  }

  pub fn get(&self, key: &str) -> Option<Arc<dyn ProviderAdapter>> {
    self.adapters.get(key).cloned()
  }

  /// Adapters feeding `layer`, ordered by key.
  pub fn for_layer(&self, layer: &str) -> Vec<Arc<dyn ProviderAdapter>> {
    let layer = FreshnessPolicy::canonical_layer(layer);
    let mut matching: Vec<Arc<dyn ProviderAdapter>> = self
      .adapters
      .values()
      .filter(|a| FreshnessPolicy::canonical_layer(a.layer()) == layer)
      .cloned()
      .collect();
    matching.sort_by(|a, b| a.key().cmp(b.key()));
    matching
  }

  pub fn providers_for_layer(&self, layer: &str) -> Vec<String> {
    self.for_layer(layer).iter().map(|a| a.key().to_string()).collect()
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.adapters.keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn is_empty(&self) -> bool {
    self.adapters.is_empty()
  }
}
