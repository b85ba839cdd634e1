//! Scan requests: serve a region from the cache, fetching only stale layers.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::adapters::{AdapterRegistry, RegionSelector, fetch_with_timeout};
use crate::cache::RegionalCacheManager;
use crate::error::ScanError;
use crate::freshness::FreshnessPolicy;
use crate::locks::{RunGuard, RunRegistry};
use crate::models::{Measurement, ScanActor};
use crate::region::{BoundingBox, validate_zoom};
use crate::store::MeasurementStore;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanRequest {
  /// `south,west,north,east`
  pub bbox: String,
  pub zoom: i64,
  pub layers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerFetchResult {
  pub success: bool,
  pub records_stored: u64,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub in_progress: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl LayerFetchResult {
  fn stored(records_stored: u64) -> Self {
    Self { success: true, records_stored, ..Default::default() }
  }

  fn failed(error: impl ToString) -> Self {
    Self { error: Some(error.to_string()), ..Default::default() }
  }

  fn busy() -> Self {
    Self {
      in_progress: true,
      error: Some("fetch already in progress for this region and layer".into()),
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
  pub cached: bool,
  pub partial_cache: bool,
  pub data: BTreeMap<String, Vec<Measurement>>,
  pub fetch_results: BTreeMap<String, LayerFetchResult>,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
  pub adapter_timeout: Duration,
  pub max_points_per_layer: i64,
}

impl Default for ScanSettings {
  fn default() -> Self {
    Self { adapter_timeout: Duration::from_secs(60), max_points_per_layer: 5000 }
  }
}

struct ValidScan {
  bbox: BoundingBox,
  zoom: u8,
  layers: Vec<String>,
}

struct Refresh {
  cached: bool,
  partial_cache: bool,
  fetch_results: BTreeMap<String, LayerFetchResult>,
}

#[derive(Clone)]
pub struct ScanService {
  store: MeasurementStore,
  cache: RegionalCacheManager,
  adapters: Arc<AdapterRegistry>,
  locks: RunRegistry,
  settings: ScanSettings,
}

impl ScanService {
  pub fn new(
    store: MeasurementStore,
    cache: RegionalCacheManager,
    adapters: Arc<AdapterRegistry>,
    locks: RunRegistry,
    settings: ScanSettings,
  ) -> Self {
    Self { store, cache, adapters, locks, settings }
  }

  fn validate(&self, request: &ScanRequest) -> Result<ValidScan, ScanError> {
    let bbox = BoundingBox::parse(&request.bbox).map_err(ScanError::InvalidRequest)?;
    let zoom = validate_zoom(request.zoom).map_err(ScanError::InvalidRequest)?;
    let layers: BTreeSet<String> = request.layers.iter().map(|l| FreshnessPolicy::canonical_layer(l)).collect();
    if layers.is_empty() {
      return Err(ScanError::InvalidRequest("at least one layer is required".into()));
    }
    if let Some(unknown) = layers.iter().find(|l| !self.cache.policy().knows(l)) {
      return Err(ScanError::InvalidRequest(format!("unknown layer '{unknown}'")));
    }
    Ok(ValidScan { bbox, zoom, layers: layers.into_iter().collect() })
  }

  /// Answers a scan request, fetching stale layers and reading every
  /// requested layer back from the store.
  pub async fn scan(&self, request: &ScanRequest, actor: ScanActor) -> Result<ScanResponse, ScanError> {
    let scan = self.validate(request)?;
    let refresh = self.refresh(&scan, actor).await?;

    let mut data = BTreeMap::new();
    for layer in &scan.layers {
      let providers = self.adapters.providers_for_layer(layer);
      let records = self
        .store
        .query_region(&scan.bbox, &providers, self.settings.max_points_per_layer)
        .await?;
      data.insert(layer.clone(), records);
    }

    Ok(ScanResponse {
      cached: refresh.cached,
      partial_cache: refresh.partial_cache,
      data,
      fetch_results: refresh.fetch_results,
    })
  }

  /// Warms the cache for a region the caller expects to be requested soon.
  pub async fn prefetch(&self, request: &ScanRequest) -> Result<BTreeMap<String, LayerFetchResult>, ScanError> {
    let scan = self.validate(request)?;
    Ok(self.refresh(&scan, ScanActor::Prefetch).await?.fetch_results)
  }

  async fn refresh(&self, scan: &ValidScan, actor: ScanActor) -> Result<Refresh, ScanError> {
    let report = self.cache.check_freshness(&scan.bbox, scan.zoom, &scan.layers).await?;
    let cached = report.stale.is_empty();
    let partial_cache = !report.fresh.is_empty() && !report.stale.is_empty();
    info!(
      bbox = %scan.bbox,
      zoom = scan.zoom,
      fresh = ?report.fresh,
      stale = ?report.stale,
      actor = actor.as_str(),
      "Scan freshness checked"
    );

    let fetches = report.stale.iter().map(|layer| self.fetch_layer(&scan.bbox, scan.zoom, layer));
    let outcomes = join_all(fetches).await;

    let mut fetch_results = BTreeMap::new();
    let mut succeeded = Vec::new();
    let mut points = 0u64;
    // guards stay alive until the scan is recorded
    let mut guards: Vec<RunGuard> = Vec::new();
    for (layer, result, guard) in outcomes {
      if result.success {
        points += result.records_stored;
        succeeded.push(layer.clone());
      }
      guards.extend(guard);
      fetch_results.insert(layer, result);
    }

    if !succeeded.is_empty() {
      let region = self.cache.record_scan(&scan.bbox, scan.zoom, &succeeded, points, actor).await?;
      info!(region_id = region.id, layers = ?succeeded, points, "Scan recorded");
    }
    drop(guards);

    Ok(Refresh { cached, partial_cache, fetch_results })
  }

  async fn fetch_layer(&self, bbox: &BoundingBox, zoom: u8, layer: &str) -> (String, LayerFetchResult, Option<RunGuard>) {
    let key = format!("scan:{}:{}", bbox.canonical_key(), layer);
    let Some(guard) = self.locks.try_acquire(key) else {
      info!(bbox = %bbox, layer, "Fetch already in progress, skipping");
      return (layer.to_string(), LayerFetchResult::busy(), None);
    };

    let adapters = self.adapters.for_layer(layer);
    if adapters.is_empty() {
      warn!(layer, "No provider registered for layer");
      return (layer.to_string(), LayerFetchResult::failed(format!("no provider registered for layer '{layer}'")), Some(guard));
    }

    let selector = RegionSelector::Area { bbox: *bbox, zoom };
    let mut records = Vec::new();
    for adapter in &adapters {
      match fetch_with_timeout(adapter.as_ref(), &selector, None, self.settings.adapter_timeout).await {
        Ok(mut fetched) => records.append(&mut fetched),
        Err(e) => {
          let message = format!("{}: {}", adapter.key(), e);
          return (layer.to_string(), LayerFetchResult::failed(message), Some(guard));
        }
      }
    }

    let result = match self.store.upsert(&records).await {
      Ok(upsert) => {
        if !upsert.rejected.is_empty() {
          warn!(layer, rejected = upsert.rejected.len(), "Some fetched records were rejected");
        }
        LayerFetchResult::stored(upsert.stored())
      }
      Err(e) => {
        warn!(layer, error = %e, "Storing fetched records failed");
        LayerFetchResult::failed(e)
      }
    };
    (layer.to_string(), result, Some(guard))
  }
}
