//! Read-only aggregation over the cache, the store and the task tables.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::cache::RegionalCacheManager;
use crate::error::StorageError;
use crate::locks::RunRegistry;
use crate::models::{CoverageStats, RunStatus};
use crate::store::MeasurementStore;
use crate::tasks::{TaskHistory, TaskRegistry};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
  pub name: String,
  pub provider: String,
  pub schedule: String,
  pub active: bool,
  pub running: bool,
  pub last_status: Option<RunStatus>,
  pub last_started: Option<DateTime<Utc>>,
  pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
  #[serde(flatten)]
  pub stats: CoverageStats,
  /// Regions that have scanned each layer.
  pub layers: BTreeMap<String, i64>,
  /// Stored measurements per provider.
  pub providers: BTreeMap<String, i64>,
  pub measurements: i64,
  pub tasks: Vec<TaskSummary>,
}

#[derive(Clone)]
pub struct CoverageReporter {
  store: MeasurementStore,
  cache: RegionalCacheManager,
  registry: TaskRegistry,
  history: TaskHistory,
  locks: RunRegistry,
}

impl CoverageReporter {
  pub fn new(
    store: MeasurementStore,
    cache: RegionalCacheManager,
    registry: TaskRegistry,
    history: TaskHistory,
    locks: RunRegistry,
  ) -> Self {
    Self { store, cache, registry, history, locks }
  }

  pub async fn stats(&self) -> Result<CoverageStats, StorageError> {
    self.store.coverage_stats().await
  }

  pub async fn report(&self) -> Result<CoverageReport, StorageError> {
    let stats = self.store.coverage_stats().await?;
    let layers = self.cache.layer_region_counts().await?.into_iter().collect();
    let providers = self.store.counts_by_provider().await?.into_iter().collect();
    let measurements = self.store.count().await?;
    let tasks = self.task_summaries().await?;
    Ok(CoverageReport { stats, layers, providers, measurements, tasks })
  }

  pub async fn task_summaries(&self) -> Result<Vec<TaskSummary>, StorageError> {
    let mut summaries = Vec::new();
    for (definition, last_started) in self.registry.list_with_last_start().await? {
      let last_status = self.history.logs(&definition.name, 1).await?.into_iter().next().map(|run| run.status);
      let next_run = if definition.active {
        match last_started {
          Some(last) => definition.schedule.next_after(last),
          None if !definition.schedule.is_on_demand() => Some(Utc::now()),
          None => None,
        }
      } else {
        None
      };
      summaries.push(TaskSummary {
        running: self.locks.is_held(&format!("task:{}", definition.name)) || last_status == Some(RunStatus::Running),
        schedule: definition.schedule.to_string(),
        name: definition.name,
        provider: definition.provider,
        active: definition.active,
        last_status,
        last_started,
        next_run,
      });
    }
    Ok(summaries)
  }
}
