//! Append-only audit trail of task runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::error::{StorageError, TaskError};
use crate::models::{RunStatus, RunTrigger, TaskRun, truncate_text};

/// Longest output or error text returned in log summaries.
pub const SUMMARY_TEXT_LIMIT: usize = 500;

const RUN_SELECT: &str = r#"
  SELECT id, task_name, status, trigger_actor, started_at, finished_at, records_processed, output, error
  FROM task_runs
"#;

#[derive(Debug, FromRow)]
struct TaskRunRow {
  id: String,
  task_name: String,
  status: String,
  trigger_actor: String,
  started_at: DateTime<Utc>,
  finished_at: Option<DateTime<Utc>>,
  records_processed: i64,
  output: Option<String>,
  error: Option<String>,
}

impl TryFrom<TaskRunRow> for TaskRun {
  type Error = StorageError;

  fn try_from(row: TaskRunRow) -> Result<Self, Self::Error> {
    Ok(TaskRun {
      id: Uuid::parse_str(&row.id).map_err(|e| StorageError::Corrupt(format!("run id {}: {e}", row.id)))?,
      status: RunStatus::parse(&row.status)
        .ok_or_else(|| StorageError::Corrupt(format!("run {}: unknown status '{}'", row.id, row.status)))?,
      trigger: RunTrigger::parse(&row.trigger_actor)
        .ok_or_else(|| StorageError::Corrupt(format!("run {}: unknown trigger '{}'", row.id, row.trigger_actor)))?,
      task_name: row.task_name,
      started_at: row.started_at,
      finished_at: row.finished_at,
      records_processed: row.records_processed,
      output: row.output,
      error: row.error,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRunSummary {
  pub id: Uuid,
  pub status: RunStatus,
  pub trigger: RunTrigger,
  pub started_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub duration_secs: Option<f64>,
  pub records_processed: i64,
  pub output: Option<String>,
  pub error: Option<String>,
}

impl From<TaskRun> for TaskRunSummary {
  fn from(run: TaskRun) -> Self {
    let duration_secs = run
      .finished_at
      .map(|end| (end - run.started_at).num_milliseconds() as f64 / 1000.0);
    Self {
      id: run.id,
      status: run.status,
      trigger: run.trigger,
      started_at: run.started_at,
      finished_at: run.finished_at,
      duration_secs,
      records_processed: run.records_processed,
      output: run.output.map(|o| truncate_text(&o, SUMMARY_TEXT_LIMIT)),
      error: run.error.map(|e| truncate_text(&e, SUMMARY_TEXT_LIMIT)),
    }
  }
}

#[derive(Clone)]
pub struct TaskHistory {
  pool: SqlitePool,
}

impl TaskHistory {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Opens a `running` row. The partial unique index on running rows turns a
  /// second concurrent start of the same task into [`TaskError::AlreadyRunning`].
  pub async fn start(&self, task: &str, trigger: RunTrigger, now: DateTime<Utc>) -> Result<Uuid, TaskError> {
    let id = Uuid::new_v4();
    let inserted = sqlx::query(
      r#"
      INSERT INTO task_runs (id, task_name, status, trigger_actor, started_at)
      VALUES (?1, ?2, ?3, ?4, ?5)
      "#,
    )
      .bind(id.to_string())
      .bind(task)
      .bind(RunStatus::Running.as_str())
      .bind(trigger.as_str())
      .bind(now)
      .execute(&self.pool)
      .await;

    match inserted {
      Ok(_) => Ok(id),
      Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(TaskError::AlreadyRunning(task.to_string())),
      Err(e) => Err(TaskError::Storage { task: task.to_string(), source: e.into() }),
    }
  }

  /// Closes a run. Only rows still `running` are touched, so a finished run
  /// is never rewritten.
  pub async fn finish(
    &self,
    id: Uuid,
    status: RunStatus,
    records_processed: u64,
    output: Option<&str>,
    error: Option<&str>,
    now: DateTime<Utc>,
  ) -> Result<(), StorageError> {
    let result = sqlx::query(
      r#"
      UPDATE task_runs
      SET status = ?1, finished_at = ?2, records_processed = ?3, output = ?4, error = ?5
      WHERE id = ?6 AND status = 'running'
      "#,
    )
      .bind(status.as_str())
      .bind(now)
      .bind(i64::try_from(records_processed).unwrap_or(i64::MAX))
      .bind(output)
      .bind(error)
      .bind(id.to_string())
      .execute(&self.pool)
      .await?;
    if result.rows_affected() == 0 {
      warn!(run_id = %id, "Run was already finalized");
    }
    Ok(())
  }

  /// Fails a run whose result could not be written, dropping its output.
  pub async fn abandon(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
    let result = sqlx::query(
      r#"
      UPDATE task_runs
      SET status = 'failed', finished_at = ?1, records_processed = 0, output = NULL, error = ?2
      WHERE id = ?3 AND status = 'running'
      "#,
    )
      .bind(now)
      .bind(truncate_text(error, SUMMARY_TEXT_LIMIT))
      .bind(id.to_string())
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  pub async fn get(&self, id: Uuid) -> Result<Option<TaskRun>, StorageError> {
    let row: Option<TaskRunRow> = sqlx::query_as(&format!("{RUN_SELECT} WHERE id = ?1"))
      .bind(id.to_string())
      .fetch_optional(&self.pool)
      .await?;
    row.map(TaskRun::try_from).transpose()
  }

  /// Most recent runs of `task`, newest first.
  pub async fn logs(&self, task: &str, limit: i64) -> Result<Vec<TaskRunSummary>, StorageError> {
    let rows: Vec<TaskRunRow> = sqlx::query_as(&format!("{RUN_SELECT} WHERE task_name = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2"))
      .bind(task)
      .bind(limit)
      .fetch_all(&self.pool)
      .await?;
    rows
      .into_iter()
      .map(|row| TaskRun::try_from(row).map(TaskRunSummary::from))
      .collect()
  }

  /// Most recent runs across every task, newest first.
  pub async fn recent(&self, limit: i64) -> Result<Vec<TaskRun>, StorageError> {
    let rows: Vec<TaskRunRow> = sqlx::query_as(&format!("{RUN_SELECT} ORDER BY started_at DESC, rowid DESC LIMIT ?1"))
      .bind(limit)
      .fetch_all(&self.pool)
      .await?;
    rows.into_iter().map(TaskRun::try_from).collect()
  }

  pub async fn last_started(&self, task: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
    let started: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(started_at) FROM task_runs WHERE task_name = ?1")
      .bind(task)
      .fetch_one(&self.pool)
      .await?;
    Ok(started)
  }

  pub async fn count_running(&self, task: &str) -> Result<i64, StorageError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_runs WHERE task_name = ?1 AND status = 'running'")
      .bind(task)
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }

  /// Fails rows left `running` by a process that died mid-run.
  pub async fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
    let result = sqlx::query(
      r#"
      UPDATE task_runs
      SET status = 'failed', finished_at = ?1, error = 'interrupted: process exited while the run was in progress'
      WHERE status = 'running'
      "#,
    )
      .bind(now)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() > 0 {
      warn!(runs = result.rows_affected(), "Marked interrupted runs as failed");
    }
    Ok(result.rows_affected())
  }
}
