use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{TaskDefinition, TaskHistory, TaskParams, TaskRegistry, TaskRunSummary};
use crate::adapters::{AdapterRegistry, RegionSelector, fetch_with_timeout};
use crate::cache::RegionalCacheManager;
use crate::error::{AdapterError, StorageError, TaskError};
use crate::locks::RunRegistry;
use crate::models::{RunStatus, RunTrigger};
use crate::store::MeasurementStore;

#[derive(Debug, Clone)]
pub struct RunSettings {
  pub adapter_timeout: Duration,
  /// Hard ceiling on a whole run, fetch and store included.
  pub run_timeout: Duration,
}

impl Default for RunSettings {
  fn default() -> Self {
    Self { adapter_timeout: Duration::from_secs(60), run_timeout: Duration::from_secs(900) }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
  pub run_id: Uuid,
  pub success: bool,
  /// Seconds.
  pub duration: f64,
  pub records_processed: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

struct Execution {
  records_processed: u64,
  output: String,
}

// delays of 10ms, then 100ms
const FINISH_RETRY_BASE: u64 = 10;
const FINISH_RETRIES: usize = 2;

fn storage(task: &str) -> impl FnOnce(StorageError) -> TaskError + '_ {
  move |source| TaskError::Storage { task: task.to_string(), source }
}

#[derive(Clone)]
pub struct TaskRunner {
  registry: TaskRegistry,
  history: TaskHistory,
  store: MeasurementStore,
  cache: RegionalCacheManager,
  adapters: Arc<AdapterRegistry>,
  locks: RunRegistry,
  settings: RunSettings,
}

impl TaskRunner {
  pub fn new(
    registry: TaskRegistry,
    history: TaskHistory,
    store: MeasurementStore,
    cache: RegionalCacheManager,
    adapters: Arc<AdapterRegistry>,
    locks: RunRegistry,
    settings: RunSettings,
  ) -> Self {
    Self { registry, history, store, cache, adapters, locks, settings }
  }

  pub fn registry(&self) -> &TaskRegistry {
    &self.registry
  }

  pub fn history(&self) -> &TaskHistory {
    &self.history
  }

  /// Runs `name` once and records exactly one run row for it.
  ///
  /// Errors are returned only when no run row was written: unknown task,
  /// task already in flight, or a storage failure around the row itself.
  /// A run that fails while fetching or storing comes back as an outcome
  /// with `success == false`.
  pub async fn run(
    &self,
    name: &str,
    overrides: Option<&Map<String, Value>>,
    trigger: RunTrigger,
  ) -> Result<RunOutcome, TaskError> {
    let definition = self
      .registry
      .get(name)
      .await
      .map_err(storage(name))?
      .ok_or_else(|| TaskError::NotFound(name.to_string()))?;

    let Some(guard) = self.locks.try_acquire(format!("task:{name}")) else {
      info!(task = name, "Task already running, rejecting");
      return Err(TaskError::AlreadyRunning(name.to_string()));
    };

    let clock = Instant::now();
    let run_id = self.history.start(name, trigger, Utc::now()).await?;
    info!(task = name, run_id = %run_id, trigger = trigger.as_str(), "Task run started");

    let result = match timeout(self.settings.run_timeout, self.execute(&definition, overrides, trigger)).await {
      Ok(result) => result,
      Err(_) => Err(TaskError::Timeout { task: name.to_string(), secs: self.settings.run_timeout.as_secs() }),
    };
    let duration = clock.elapsed().as_secs_f64();

    let outcome = match result {
      Ok(execution) => {
        self
          .close_run(name, run_id, RunStatus::Completed, execution.records_processed, Some(&execution.output), None)
          .await?;
        info!(task = name, run_id = %run_id, duration, records = execution.records_processed, "Task run completed");
        RunOutcome { run_id, success: true, duration, records_processed: execution.records_processed, error: None }
      }
      Err(e) => {
        let message = e.to_string();
        self.close_run(name, run_id, RunStatus::Failed, 0, None, Some(&message)).await?;
        error!(task = name, run_id = %run_id, duration, error = %message, "Task run failed");
        RunOutcome { run_id, success: false, duration, records_processed: 0, error: Some(message) }
      }
    };
    drop(guard);
    Ok(outcome)
  }

  /// Writes the result of a run, retrying briefly. When the result cannot be
  /// written the row is still moved out of `running`, so the task stays
  /// startable.
  async fn close_run(
    &self,
    name: &str,
    run_id: Uuid,
    status: RunStatus,
    records_processed: u64,
    output: Option<&str>,
    error: Option<&str>,
  ) -> Result<(), TaskError> {
    let strategy = ExponentialBackoff::from_millis(FINISH_RETRY_BASE).take(FINISH_RETRIES);
    let finished = Retry::spawn(strategy, || {
      self.history.finish(run_id, status, records_processed, output, error, Utc::now())
    })
    .await;

    let Err(e) = finished else {
      return Ok(());
    };
    error!(task = name, run_id = %run_id, error = %e, "Could not record run result");
    if let Err(fallback) = self.history.abandon(run_id, &format!("could not record run result: {e}"), Utc::now()).await {
      error!(task = name, run_id = %run_id, error = %fallback, "Run left in running state");
    }
    Err(storage(name)(e))
  }

  async fn execute(
    &self,
    definition: &TaskDefinition,
    overrides: Option<&Map<String, Value>>,
    trigger: RunTrigger,
  ) -> Result<Execution, TaskError> {
    let task = definition.name.as_str();
    let invalid = |reason: String| TaskError::InvalidParams { task: task.to_string(), reason };
    let params = TaskParams::resolve(&definition.params, overrides).map_err(invalid)?;
    let selector = params.selector().map_err(invalid)?;

    let provider = definition.provider.as_str();
    let adapter = self.adapters.get(provider).ok_or_else(|| TaskError::Adapter {
      task: task.to_string(),
      provider: provider.to_string(),
      source: AdapterError::Other(format!("no adapter registered under '{provider}'")),
    })?;

    let since = self.since(task, provider, &params).await?;
    let records = fetch_with_timeout(adapter.as_ref(), &selector, since, self.settings.adapter_timeout)
      .await
      .map_err(|source| TaskError::Adapter { task: task.to_string(), provider: provider.to_string(), source })?;

    let upsert = self.store.upsert(&records).await.map_err(storage(task))?;
    if !upsert.rejected.is_empty() {
      warn!(task, rejected = upsert.rejected.len(), "Some fetched records were rejected");
    }

    if let RegionSelector::Area { bbox, zoom } = &selector {
      let layers = vec![adapter.layer().to_string()];
      self
        .cache
        .record_scan(bbox, *zoom, &layers, upsert.stored(), trigger.scan_actor())
        .await
        .map_err(storage(task))?;
    }

    Ok(Execution {
      records_processed: upsert.stored(),
      output: format!(
        "fetched {} records from {}: {} inserted, {} updated, {} rejected",
        records.len(),
        selector,
        upsert.inserted,
        upsert.updated,
        upsert.rejected.len()
      ),
    })
  }

  /// Lower bound for an incremental fetch: the newest stored reading of the
  /// tracked metric, else the lookback window, else nothing.
  async fn since(&self, task: &str, provider: &str, params: &TaskParams) -> Result<Option<DateTime<Utc>>, TaskError> {
    if let Some(metric) = &params.incremental_metric {
      if let Some(latest) = self.store.latest_timestamp(provider, metric).await.map_err(storage(task))? {
        return Ok(Some(latest));
      }
    }
    Ok(params.lookback_hours.map(|hours| Utc::now() - chrono::Duration::hours(hours)))
  }

  pub async fn logs(&self, name: &str, limit: i64) -> Result<Vec<TaskRunSummary>, TaskError> {
    if self.registry.get(name).await.map_err(storage(name))?.is_none() {
      return Err(TaskError::NotFound(name.to_string()));
    }
    self.history.logs(name, limit).await.map_err(storage(name))
  }

  /// Fires every task due at `now`. Tasks still in flight are skipped.
  pub async fn run_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<(String, RunOutcome)>, StorageError> {
    let mut outcomes = Vec::new();
    for definition in self.registry.due_tasks(now).await? {
      match self.run(&definition.name, None, RunTrigger::Schedule).await {
        Ok(outcome) => outcomes.push((definition.name, outcome)),
        Err(TaskError::AlreadyRunning(name)) => info!(task = %name, "Due task still running, skipped"),
        Err(e) => error!(task = %definition.name, error = %e, "Scheduled run could not start"),
      }
    }
    Ok(outcomes)
  }
}
