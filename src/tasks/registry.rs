use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};
use tracing::info;

use super::{Schedule, TaskDefinition};
use crate::error::StorageError;

#[derive(Debug, FromRow)]
struct TaskRow {
  name: String,
  description: String,
  provider: String,
  schedule: String,
  params: String,
  active: bool,
  last_started: Option<DateTime<Utc>>,
}

impl TaskRow {
  fn into_definition(self) -> Result<(TaskDefinition, Option<DateTime<Utc>>), StorageError> {
    let schedule: Schedule = self
      .schedule
      .parse()
      .map_err(|e| StorageError::Corrupt(format!("task {}: {e}", self.name)))?;
    let params: Map<String, Value> = serde_json::from_str(&self.params)?;
    let definition = TaskDefinition {
      name: self.name,
      description: self.description,
      provider: self.provider,
      schedule,
      active: self.active,
      params,
    };
    Ok((definition, self.last_started))
  }
}

const TASK_SELECT: &str = r#"
  SELECT t.name, t.description, t.provider, t.schedule, t.params, t.active,
         (SELECT MAX(r.started_at) FROM task_runs r WHERE r.task_name = t.name) AS last_started
  FROM tasks t
"#;

/// Persistent table of task definitions.
#[derive(Clone)]
pub struct TaskRegistry {
  pool: SqlitePool,
}

impl TaskRegistry {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Inserts or refreshes a definition. The stored active flag wins over the
  /// one in `definition` once the task exists, since it is owned by admins.
  pub async fn register(&self, definition: &TaskDefinition) -> Result<(), StorageError> {
    let now = Utc::now();
    sqlx::query(
      r#"
      INSERT INTO tasks (name, description, provider, schedule, params, active, created_at, updated_at)
      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
      ON CONFLICT (name) DO UPDATE SET
        description = excluded.description,
        provider = excluded.provider,
        schedule = excluded.schedule,
        params = excluded.params,
        updated_at = excluded.updated_at
      "#,
    )
      .bind(&definition.name)
      .bind(&definition.description)
      .bind(&definition.provider)
      .bind(definition.schedule.to_string())
      .bind(serde_json::to_string(&definition.params)?)
      .bind(definition.active)
      .bind(now)
      .execute(&self.pool)
      .await?;
    info!(task = %definition.name, provider = %definition.provider, schedule = %definition.schedule, "Task registered");
    Ok(())
  }

  pub async fn get(&self, name: &str) -> Result<Option<TaskDefinition>, StorageError> {
    let row: Option<TaskRow> = sqlx::query_as(&format!("{TASK_SELECT} WHERE t.name = ?1"))
      .bind(name)
      .fetch_optional(&self.pool)
      .await?;
    row.map(|r| r.into_definition().map(|(definition, _)| definition)).transpose()
  }

  pub async fn list(&self) -> Result<Vec<TaskDefinition>, StorageError> {
    Ok(self.list_with_last_start().await?.into_iter().map(|(definition, _)| definition).collect())
  }

  /// Every task with the start time of its most recent run.
  pub async fn list_with_last_start(&self) -> Result<Vec<(TaskDefinition, Option<DateTime<Utc>>)>, StorageError> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!("{TASK_SELECT} ORDER BY t.name"))
      .fetch_all(&self.pool)
      .await?;
    rows.into_iter().map(TaskRow::into_definition).collect()
  }

  /// Returns whether the task existed.
  pub async fn set_active(&self, name: &str, active: bool) -> Result<bool, StorageError> {
    let result = sqlx::query("UPDATE tasks SET active = ?1, updated_at = ?2 WHERE name = ?3")
      .bind(active)
      .bind(Utc::now())
      .bind(name)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  /// Active scheduled tasks whose next fire time is at or before `now`.
  pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<TaskDefinition>, StorageError> {
    Ok(
      self
        .list_with_last_start()
        .await?
        .into_iter()
        .filter(|(definition, last_started)| definition.active && definition.schedule.is_due(*last_started, now))
        .map(|(definition, _)| definition)
        .collect(),
    )
  }
}
