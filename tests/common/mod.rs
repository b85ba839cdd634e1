#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envcache::adapters::{AdapterRegistry, ProviderAdapter, RegionSelector};
use envcache::app::AppContext;
use envcache::database::memory_database;
use envcache::error::AdapterError;
use envcache::freshness::FreshnessPolicy;
use envcache::models::Measurement;
use envcache::scan::ScanSettings;
use envcache::tasks::RunSettings;

#[derive(Clone)]
pub enum Script {
  Records(Vec<Measurement>),
  Fail(String),
  Hang(Duration),
}

/// In-process adapter that replays a script and counts its calls.
pub struct ScriptedAdapter {
  key: String,
  layer: String,
  script: Mutex<Script>,
  calls: AtomicUsize,
  selectors: Mutex<Vec<(RegionSelector, Option<DateTime<Utc>>)>>,
}

impl ScriptedAdapter {
  pub fn new(key: &str, layer: &str, script: Script) -> Arc<Self> {
    Arc::new(Self {
      key: key.to_string(),
      layer: layer.to_string(),
      script: Mutex::new(script),
      calls: AtomicUsize::new(0),
      selectors: Mutex::new(Vec::new()),
    })
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn set_script(&self, script: Script) {
    *self.script.lock().unwrap() = script;
  }

  pub fn last_call(&self) -> Option<(RegionSelector, Option<DateTime<Utc>>)> {
    self.selectors.lock().unwrap().last().cloned()
  }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
  fn key(&self) -> &str {
    &self.key
  }

  fn layer(&self) -> &str {
    &self.layer
  }

  async fn fetch(&self, selector: &RegionSelector, since: Option<DateTime<Utc>>) -> Result<Vec<Measurement>, AdapterError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.selectors.lock().unwrap().push((selector.clone(), since));
    let script = self.script.lock().unwrap().clone();
    match script {
      Script::Records(records) => Ok(records),
      Script::Fail(message) => Err(AdapterError::Status { status: 503, body: message }),
      Script::Hang(duration) => {
        tokio::time::sleep(duration).await;
        Ok(Vec::new())
      }
    }
  }
}

pub fn ts(h: u32, m: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap()
}

pub fn fire(lat: f64, lon: f64, at: DateTime<Utc>, frp: f64) -> Measurement {
  Measurement::new("firms", "frp", at).with_value(frp, "MW").at(lat, lon)
}

pub fn pm25(lat: f64, lon: f64, at: DateTime<Utc>, value: f64) -> Measurement {
  Measurement::new("openaq", "pm25", at).with_value(value, "ug/m3").at(lat, lon)
}

pub async fn context_with(adapters: Vec<Arc<dyn ProviderAdapter>>, run_settings: RunSettings) -> AppContext {
  let pool = memory_database().await.unwrap();
  let mut registry = AdapterRegistry::new();
  for adapter in adapters {
    registry.register(adapter);
  }
  AppContext::new(pool, registry, FreshnessPolicy::default(), ScanSettings::default(), run_settings)
}

pub async fn context(adapters: Vec<Arc<dyn ProviderAdapter>>) -> AppContext {
  context_with(adapters, RunSettings::default()).await
}
