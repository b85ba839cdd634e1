use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::{AdapterRegistry, FeedAdapter};
use crate::freshness::FreshnessPolicy;
use crate::tasks::TaskDefinition;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: Option<String>,
  pub server_port: u16,
  pub catalog_path: Option<String>,
  pub adapter_timeout: Duration,
  pub run_timeout: Duration,
  pub worker_concurrency: usize,
  pub tick_interval: Duration,
  pub max_points_per_layer: i64,
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
  T::Err: std::fmt::Display,
{
  match lookup(key) {
    Some(raw) if !raw.trim().is_empty() => raw
      .trim()
      .parse()
      .map_err(|e| anyhow!("{key}: invalid value '{raw}': {e}")),
    _ => Ok(default),
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let worker_concurrency: usize = parsed(&lookup, "WORKER_CONCURRENCY", 4)?;
    if worker_concurrency == 0 {
      return Err(anyhow!("WORKER_CONCURRENCY must be at least 1"));
    }
    let tick_secs: u64 = parsed(&lookup, "TICK_INTERVAL_SECS", 60)?;
    if tick_secs == 0 {
      return Err(anyhow!("TICK_INTERVAL_SECS must be at least 1"));
    }
    Ok(Self {
      database_url: non_empty("DATABASE_URL").unwrap_or_else(|| "sqlite://envcache.db".into()),
      rabbitmq_url: non_empty("RABBITMQ_URL"),
      server_port: parsed(&lookup, "SERVER_PORT", 8080)?,
      catalog_path: non_empty("ENVCACHE_CATALOG"),
      adapter_timeout: Duration::from_secs(parsed(&lookup, "ADAPTER_TIMEOUT_SECS", 60)?),
      run_timeout: Duration::from_secs(parsed(&lookup, "RUN_TIMEOUT_SECS", 900)?),
      worker_concurrency,
      tick_interval: Duration::from_secs(tick_secs),
      max_points_per_layer: parsed(&lookup, "MAX_POINTS_PER_LAYER", 5000)?,
    })
  }
}

/// A feed-backed provider declared in the catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
  pub key: String,
  pub layer: String,
  pub url: String,
  #[serde(default)]
  pub query: BTreeMap<String, String>,
}

/// Providers, tasks and freshness overrides loaded at start-up.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
  #[serde(default)]
  pub providers: Vec<ProviderConfig>,
  #[serde(default)]
  pub tasks: Vec<TaskDefinition>,
  /// Layer to window in seconds.
  #[serde(default)]
  pub freshness: HashMap<String, u64>,
}

impl Catalog {
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading catalog {}", path.display()))?;
    Self::from_toml_str(&raw).with_context(|| format!("parsing catalog {}", path.display()))
  }

  pub fn from_toml_str(raw: &str) -> Result<Self> {
    let catalog: Catalog = toml::from_str(raw)?;
    catalog.validate()?;
    Ok(catalog)
  }

  fn validate(&self) -> Result<()> {
    let mut keys = std::collections::HashSet::new();
    for provider in &self.providers {
      if !keys.insert(provider.key.as_str()) {
        return Err(anyhow!("provider '{}' declared twice", provider.key));
      }
    }
    let mut names = std::collections::HashSet::new();
    for task in &self.tasks {
      if !names.insert(task.name.as_str()) {
        return Err(anyhow!("task '{}' declared twice", task.name));
      }
      if !keys.contains(task.provider.as_str()) {
        return Err(anyhow!("task '{}' uses undeclared provider '{}'", task.name, task.provider));
      }
    }
    if let Some((layer, secs)) = self.freshness.iter().find(|(_, secs)| FreshnessPolicy::window_from_secs(**secs).is_none()) {
      return Err(anyhow!("freshness window for '{layer}' is out of range: {secs}s"));
    }
    Ok(())
  }

  pub fn freshness_policy(&self) -> FreshnessPolicy {
    FreshnessPolicy::default().with_overrides(&self.freshness)
  }

  pub fn build_adapters(&self, request_timeout: Duration) -> Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    for provider in &self.providers {
      let adapter = FeedAdapter::new(&provider.key, &provider.layer, &provider.url, request_timeout)
        .with_context(|| format!("building adapter '{}'", provider.key))?
        .with_query(provider.query.clone());
      registry.register(Arc::new(adapter));
    }
    Ok(registry)
  }
}
