use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::adapters::AdapterRegistry;
use crate::cache::RegionalCacheManager;
use crate::config::{Catalog, Config};
use crate::coverage::CoverageReporter;
use crate::freshness::FreshnessPolicy;
use crate::locks::RunRegistry;
use crate::scan::{ScanService, ScanSettings};
use crate::store::MeasurementStore;
use crate::tasks::{RunSettings, TaskDefinition, TaskHistory, TaskRegistry, TaskRunner};

/// Every long-lived component, built once per process and shared by handle.
#[derive(Clone)]
pub struct AppContext {
  pub pool: SqlitePool,
  pub store: MeasurementStore,
  pub cache: RegionalCacheManager,
  pub adapters: Arc<AdapterRegistry>,
  pub locks: RunRegistry,
  pub scans: ScanService,
  pub runner: TaskRunner,
  pub coverage: CoverageReporter,
}

impl AppContext {
  pub fn new(
    pool: SqlitePool,
    adapters: AdapterRegistry,
    policy: FreshnessPolicy,
    scan_settings: ScanSettings,
    run_settings: RunSettings,
  ) -> Self {
    let store = MeasurementStore::new(pool.clone());
    let cache = RegionalCacheManager::new(pool.clone(), Arc::new(policy));
    let adapters = Arc::new(adapters);
    let locks = RunRegistry::new();
    let registry = TaskRegistry::new(pool.clone());
    let history = TaskHistory::new(pool.clone());

    let scans = ScanService::new(store.clone(), cache.clone(), adapters.clone(), locks.clone(), scan_settings);
    let runner = TaskRunner::new(
      registry.clone(),
      history.clone(),
      store.clone(),
      cache.clone(),
      adapters.clone(),
      locks.clone(),
      run_settings,
    );
    let coverage = CoverageReporter::new(store.clone(), cache.clone(), registry, history, locks.clone());

    Self { pool, store, cache, adapters, locks, scans, runner, coverage }
  }

  /// Builds the context from a catalog, registers its tasks and fails any
  /// run a previous process left open.
  pub async fn build(pool: SqlitePool, catalog: &Catalog, config: &Config) -> Result<Self> {
    let adapters = catalog.build_adapters(config.adapter_timeout)?;
    let scan_settings = ScanSettings {
      adapter_timeout: config.adapter_timeout,
      max_points_per_layer: config.max_points_per_layer,
    };
    let run_settings = RunSettings { adapter_timeout: config.adapter_timeout, run_timeout: config.run_timeout };
    let context = Self::new(pool, adapters, catalog.freshness_policy(), scan_settings, run_settings);

    context.register_tasks(&catalog.tasks).await?;
    context.runner.history().recover_interrupted(Utc::now()).await?;
    info!(providers = context.adapters.keys().len(), tasks = catalog.tasks.len(), "Application context ready");
    Ok(context)
  }

  pub async fn register_tasks(&self, tasks: &[TaskDefinition]) -> Result<()> {
    for task in tasks {
      self.runner.registry().register(task).await?;
    }
    Ok(())
  }
}

/// Loads the catalog named by the config, or an empty one.
pub fn load_catalog(config: &Config) -> Result<Catalog> {
  match &config.catalog_path {
    Some(path) => Catalog::load(path),
    None => Ok(Catalog::default()),
  }
}
