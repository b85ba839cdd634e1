//! Deduplicating measurement store.
//!
//! Every record is merged with one `INSERT .. ON CONFLICT DO UPDATE` keyed on
//! (provider, metric, observed_at, location_key), and each call to
//! [`MeasurementStore::upsert`] runs in a single transaction. The `revision`
//! column starts at 0 and is bumped on every update, which is how the engine
//! tells an insert from an update without a second lookup.

use chrono::{DateTime, Utc};
use serde_json::Map;
use sqlx::{FromRow, QueryBuilder, Row, Sqlite, SqlitePool};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::models::{CoverageStats, Measurement, RejectedRecord, UpsertResult};
use crate::region::BoundingBox;

const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(30);

const UPSERT_SQL: &str = r#"
  INSERT INTO measurements
    (provider, metric, observed_at, location_key, latitude, longitude, value, unit, metadata, revision, ingested_at, updated_at)
  VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)
  ON CONFLICT (provider, metric, observed_at, location_key) DO UPDATE SET
    latitude = excluded.latitude,
    longitude = excluded.longitude,
    value = excluded.value,
    unit = excluded.unit,
    metadata = excluded.metadata,
    revision = measurements.revision + 1,
    updated_at = excluded.updated_at
  RETURNING revision
"#;

#[derive(Debug, FromRow)]
struct MeasurementRow {
  provider: String,
  metric: String,
  value: Option<f64>,
  unit: Option<String>,
  latitude: Option<f64>,
  longitude: Option<f64>,
  observed_at: DateTime<Utc>,
  metadata: String,
}

impl TryFrom<MeasurementRow> for Measurement {
  type Error = StorageError;

  fn try_from(row: MeasurementRow) -> Result<Self, Self::Error> {
    let metadata: Map<String, serde_json::Value> = serde_json::from_str(&row.metadata)?;
    Ok(Measurement {
      provider: row.provider,
      metric: row.metric,
      value: row.value,
      unit: row.unit,
      latitude: row.latitude,
      longitude: row.longitude,
      timestamp: row.observed_at,
      metadata,
    })
  }
}

#[derive(Clone)]
pub struct MeasurementStore {
  pool: SqlitePool,
  tx_timeout: Duration,
}

impl MeasurementStore {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool, tx_timeout: DEFAULT_TX_TIMEOUT }
  }

  pub fn with_timeout(mut self, tx_timeout: Duration) -> Self {
    self.tx_timeout = tx_timeout;
    self
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }

  /// Merges `records` into the store.
  ///
  /// Malformed records are reported in `rejected` and skipped. Any database
  /// failure (or the transaction timeout) rolls back the whole batch.
  pub async fn upsert(&self, records: &[Measurement]) -> Result<UpsertResult, StorageError> {
    match timeout(self.tx_timeout, self.upsert_batch(records)).await {
      Ok(result) => result,
      Err(_) => {
        warn!(records = records.len(), "Measurement upsert timed out, batch rolled back");
        Err(StorageError::Timeout(self.tx_timeout.as_secs()))
      }
    }
  }

  async fn upsert_batch(&self, records: &[Measurement]) -> Result<UpsertResult, StorageError> {
    let now = Utc::now();
    let mut result = UpsertResult::default();
    let mut tx = self.pool.begin().await?;

    for (index, record) in records.iter().enumerate() {
      let location_key = match record.location_key() {
        Ok(key) => key,
        Err(reason) => {
          debug!(index, %reason, "Rejected measurement");
          result.rejected.push(RejectedRecord { index, reason: reason.to_string() });
          continue;
        }
      };
      let metadata = serde_json::to_string(&record.metadata)?;

      let revision: i64 = sqlx::query_scalar(UPSERT_SQL)
        .bind(record.provider.trim())
        .bind(record.metric.trim())
        .bind(record.timestamp)
        .bind(&location_key)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.value)
        .bind(record.unit.as_deref())
        .bind(metadata)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

      if revision == 0 {
        result.inserted += 1;
      } else {
        result.updated += 1;
      }
    }

    tx.commit().await?;
    Ok(result)
  }

  /// Newest event time stored for a provider/metric pair.
  pub async fn latest_timestamp(&self, provider: &str, metric: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
    let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
      "SELECT MAX(observed_at) FROM measurements WHERE provider = ?1 AND metric = ?2",
    )
      .bind(provider)
      .bind(metric)
      .fetch_one(&self.pool)
      .await?;
    Ok(latest)
  }

  /// Spatial readings from `providers` inside `bbox`, newest first.
  pub async fn query_region(
    &self,
    bbox: &BoundingBox,
    providers: &[String],
    limit: i64,
  ) -> Result<Vec<Measurement>, StorageError> {
    if providers.is_empty() {
      return Ok(Vec::new());
    }

    let mut query = QueryBuilder::<Sqlite>::new(
      "SELECT provider, metric, value, unit, latitude, longitude, observed_at, metadata FROM measurements WHERE latitude BETWEEN ",
    );
    query
      .push_bind(bbox.south)
      .push(" AND ")
      .push_bind(bbox.north)
      .push(" AND longitude BETWEEN ")
      .push_bind(bbox.west)
      .push(" AND ")
      .push_bind(bbox.east)
      .push(" AND provider IN (");
    let mut separated = query.separated(", ");
    for provider in providers {
      separated.push_bind(provider);
    }
    separated.push_unseparated(") ORDER BY observed_at DESC, id DESC LIMIT ");
    query.push_bind(limit);

    let rows: Vec<MeasurementRow> = query.build_query_as().fetch_all(&self.pool).await?;
    rows.into_iter().map(Measurement::try_from).collect()
  }

  pub async fn count(&self) -> Result<i64, StorageError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM measurements")
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }

  pub async fn counts_by_provider(&self) -> Result<Vec<(String, i64)>, StorageError> {
    let rows = sqlx::query("SELECT provider, COUNT(*) AS n FROM measurements GROUP BY provider ORDER BY provider")
      .fetch_all(&self.pool)
      .await?;
    rows
      .iter()
      .map(|row| -> Result<(String, i64), StorageError> { Ok((row.try_get("provider")?, row.try_get("n")?)) })
      .collect()
  }

  /// Aggregate view over the scanned-region table.
  pub async fn coverage_stats(&self) -> Result<CoverageStats, StorageError> {
    let row = sqlx::query(
      r#"
      SELECT
        COUNT(*) AS total_regions,
        COALESCE(SUM(data_points_cached), 0) AS total_points,
        MIN(first_scanned) AS oldest,
        MAX(last_updated) AS newest
      FROM scanned_regions
      "#,
    )
      .fetch_one(&self.pool)
      .await?;

    let total_regions: i64 = row.try_get("total_regions")?;
    let total_data_points: i64 = row.try_get("total_points")?;
    let avg_points_per_region = if total_regions > 0 {
      total_data_points as f64 / total_regions as f64
    } else {
      0.0
    };

    Ok(CoverageStats {
      total_regions,
      total_data_points,
      oldest_scan: row.try_get("oldest")?,
      newest_scan: row.try_get("newest")?,
      avg_points_per_region,
    })
  }
}
