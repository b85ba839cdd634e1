//! Regional scan cache.
//!
//! Remembers which bounding boxes were fetched for which layers, and answers
//! whether a new request can be served from the store. Each layer of a region
//! carries its own last-scanned time, so a region that was refreshed for `air`
//! does not make its older `fires` data look fresh.

use chrono::{DateTime, Utc};
use sqlx::{Executor, FromRow, QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::StorageError;
use crate::freshness::FreshnessPolicy;
use crate::models::{FreshnessReport, LayerScan, ScanActor, ScannedRegion};
use crate::region::BoundingBox;

/// Share of the query box a region must cover to answer for it.
pub const COVERAGE_THRESHOLD: f64 = 0.9;
/// Share of an existing region a new scan must cover to be merged into it.
pub const MERGE_THRESHOLD: f64 = 0.9;
/// A region answers queries up to this many zoom levels finer than its own.
pub const ZOOM_TOLERANCE: u8 = 2;

const REGION_SELECT: &str = r#"
  SELECT r.id, r.south, r.west, r.north, r.east, r.zoom, r.first_scanned, r.last_updated,
         r.data_points_cached, r.actor, l.layer, l.last_scanned
  FROM scanned_regions r
  LEFT JOIN scanned_region_layers l ON l.region_id = r.id
"#;

#[derive(Debug, FromRow)]
struct RegionLayerRow {
  id: i64,
  south: f64,
  west: f64,
  north: f64,
  east: f64,
  zoom: i64,
  first_scanned: DateTime<Utc>,
  last_updated: DateTime<Utc>,
  data_points_cached: i64,
  actor: String,
  layer: Option<String>,
  last_scanned: Option<DateTime<Utc>>,
}

fn group_regions(rows: Vec<RegionLayerRow>) -> Result<Vec<ScannedRegion>, StorageError> {
  let mut regions: Vec<ScannedRegion> = Vec::new();
  let mut positions: HashMap<i64, usize> = HashMap::new();

  for row in rows {
    let idx = match positions.get(&row.id) {
      Some(idx) => *idx,
      None => {
        let actor = ScanActor::parse(&row.actor)
          .ok_or_else(|| StorageError::Corrupt(format!("unknown scan actor '{}'", row.actor)))?;
        regions.push(ScannedRegion {
          id: row.id,
          bbox: BoundingBox { south: row.south, west: row.west, north: row.north, east: row.east },
          zoom: row.zoom.clamp(0, u8::MAX as i64) as u8,
          first_scanned: row.first_scanned,
          last_updated: row.last_updated,
          data_points_cached: row.data_points_cached,
          layers: Vec::new(),
          actor,
        });
        positions.insert(row.id, regions.len() - 1);
        regions.len() - 1
      }
    };
    if let (Some(layer), Some(last_scanned)) = (row.layer, row.last_scanned) {
      regions[idx].layers.push(LayerScan { layer, last_scanned });
    }
  }

  for region in &mut regions {
    region.layers.sort_by(|a, b| a.layer.cmp(&b.layer));
  }
  Ok(regions)
}

async fn load_intersecting<'e, E>(executor: E, bbox: &BoundingBox) -> Result<Vec<ScannedRegion>, StorageError>
where
  E: Executor<'e, Database = Sqlite>,
{
  let mut query = QueryBuilder::<Sqlite>::new(REGION_SELECT);
  query
    .push(" WHERE r.south < ")
    .push_bind(bbox.north)
    .push(" AND r.north > ")
    .push_bind(bbox.south)
    .push(" AND r.west < ")
    .push_bind(bbox.east)
    .push(" AND r.east > ")
    .push_bind(bbox.west)
    .push(" ORDER BY r.last_updated DESC, r.id DESC");
  let rows: Vec<RegionLayerRow> = query.build_query_as().fetch_all(executor).await?;
  group_regions(rows)
}

/// A scan may extend `region` when it re-covers most of it at a similar zoom,
/// and growing the box does not stretch older layers over ground they were
/// never fetched for.
fn can_merge(region: &ScannedRegion, bbox: &BoundingBox, zoom: u8, scanned: &BTreeSet<String>) -> bool {
  region.zoom.abs_diff(zoom) <= ZOOM_TOLERANCE
    && bbox.coverage_of(&region.bbox) >= MERGE_THRESHOLD
    && (region.bbox.contains(bbox) || region.layers_scanned().is_subset(scanned))
}

fn answers_query(region: &ScannedRegion, bbox: &BoundingBox, zoom: u8) -> bool {
  region.zoom.saturating_add(ZOOM_TOLERANCE) >= zoom && region.bbox.coverage_of(bbox) >= COVERAGE_THRESHOLD
}

#[derive(Clone)]
pub struct RegionalCacheManager {
  pool: SqlitePool,
  policy: Arc<FreshnessPolicy>,
}

impl RegionalCacheManager {
  pub fn new(pool: SqlitePool, policy: Arc<FreshnessPolicy>) -> Self {
    Self { pool, policy }
  }

  pub fn policy(&self) -> &FreshnessPolicy {
    &self.policy
  }

  pub async fn check_freshness(
    &self,
    bbox: &BoundingBox,
    zoom: u8,
    layers: &[String],
  ) -> Result<FreshnessReport, StorageError> {
    self.check_freshness_at(bbox, zoom, layers, Utc::now()).await
  }

  /// Splits `layers` into fresh and stale as of `now`.
  ///
  /// Among the regions that cover the query, the newest scan of each layer
  /// decides. A layer with no covering region, or with no configured window,
  /// is stale.
  pub async fn check_freshness_at(
    &self,
    bbox: &BoundingBox,
    zoom: u8,
    layers: &[String],
    now: DateTime<Utc>,
  ) -> Result<FreshnessReport, StorageError> {
    let regions = load_intersecting(&self.pool, bbox).await?;
    let covering: Vec<&ScannedRegion> = regions.iter().filter(|r| answers_query(r, bbox, zoom)).collect();

    let mut report = FreshnessReport::default();
    for layer in layers {
      let layer = FreshnessPolicy::canonical_layer(layer);
      let newest = covering.iter().filter_map(|r| r.layer_scanned_at(&layer)).max();
      let fresh = match (self.policy.window(&layer), newest) {
        (Some(window), Some(scanned)) => now - scanned <= window,
        _ => false,
      };
      debug!(layer = %layer, fresh, covering = covering.len(), "Freshness evaluated");
      if fresh {
        report.fresh.insert(layer);
      } else {
        report.stale.insert(layer);
      }
    }
    Ok(report)
  }

  pub async fn record_scan(
    &self,
    bbox: &BoundingBox,
    zoom: u8,
    layers: &[String],
    points_cached: u64,
    actor: ScanActor,
  ) -> Result<ScannedRegion, StorageError> {
    self.record_scan_at(bbox, zoom, layers, points_cached, actor, Utc::now()).await
  }

  /// Records a completed scan, extending an existing region when this scan
  /// re-covers most of it and every layer that region already holds.
  pub async fn record_scan_at(
    &self,
    bbox: &BoundingBox,
    zoom: u8,
    layers: &[String],
    points_cached: u64,
    actor: ScanActor,
    now: DateTime<Utc>,
  ) -> Result<ScannedRegion, StorageError> {
    let points = i64::try_from(points_cached).unwrap_or(i64::MAX);
    let mut tx = self.pool.begin().await?;

    let scanned: BTreeSet<String> = layers.iter().map(|l| FreshnessPolicy::canonical_layer(l)).collect();
    let existing = load_intersecting(&mut *tx, bbox).await?;
    let target = existing
      .into_iter()
      .filter(|r| can_merge(r, bbox, zoom, &scanned))
      .max_by_key(|r| (r.last_updated, r.id));

    let region_id = match target {
      Some(region) => {
        let merged = region.bbox.union(bbox);
        let last_updated = region.last_updated.max(now);
        sqlx::query(
          r#"
          UPDATE scanned_regions
          SET south = ?1, west = ?2, north = ?3, east = ?4, zoom = ?5,
              last_updated = ?6, data_points_cached = data_points_cached + ?7, actor = ?8
          WHERE id = ?9
          "#,
        )
          .bind(merged.south)
          .bind(merged.west)
          .bind(merged.north)
          .bind(merged.east)
          .bind(region.zoom.min(zoom) as i64)
          .bind(last_updated)
          .bind(points)
          .bind(actor.as_str())
          .bind(region.id)
          .execute(&mut *tx)
          .await?;
        debug!(region_id = region.id, bbox = %bbox, "Extended scanned region");
        region.id
      }
      None => {
        let id: i64 = sqlx::query_scalar(
          r#"
          INSERT INTO scanned_regions (south, west, north, east, zoom, first_scanned, last_updated, data_points_cached, actor)
          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)
          RETURNING id
          "#,
        )
          .bind(bbox.south)
          .bind(bbox.west)
          .bind(bbox.north)
          .bind(bbox.east)
          .bind(zoom as i64)
          .bind(now)
          .bind(points)
          .bind(actor.as_str())
          .fetch_one(&mut *tx)
          .await?;
        debug!(region_id = id, bbox = %bbox, "Recorded new scanned region");
        id
      }
    };

    for layer in layers {
      sqlx::query(
        r#"
        INSERT INTO scanned_region_layers (region_id, layer, last_scanned) VALUES (?1, ?2, ?3)
        ON CONFLICT (region_id, layer) DO UPDATE SET last_scanned = excluded.last_scanned
        "#,
      )
        .bind(region_id)
        .bind(FreshnessPolicy::canonical_layer(layer))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    self
      .region(region_id)
      .await?
      .ok_or_else(|| StorageError::Corrupt(format!("scanned region {region_id} vanished after commit")))
  }

  pub async fn region(&self, id: i64) -> Result<Option<ScannedRegion>, StorageError> {
    let mut query = QueryBuilder::<Sqlite>::new(REGION_SELECT);
    query.push(" WHERE r.id = ").push_bind(id);
    let rows: Vec<RegionLayerRow> = query.build_query_as().fetch_all(&self.pool).await?;
    Ok(group_regions(rows)?.into_iter().next())
  }

  /// Regions intersecting `bbox`, most recently updated first.
  pub async fn overlapping_regions(&self, bbox: &BoundingBox) -> Result<Vec<ScannedRegion>, StorageError> {
    load_intersecting(&self.pool, bbox).await
  }

  pub async fn recent_regions(&self, limit: i64) -> Result<Vec<ScannedRegion>, StorageError> {
    let mut query = QueryBuilder::<Sqlite>::new(REGION_SELECT);
    query
      .push(" WHERE r.id IN (SELECT id FROM scanned_regions ORDER BY last_updated DESC, id DESC LIMIT ")
      .push_bind(limit)
      .push(") ORDER BY r.last_updated DESC, r.id DESC");
    let rows: Vec<RegionLayerRow> = query.build_query_as().fetch_all(&self.pool).await?;
    group_regions(rows)
  }

  /// Number of regions that have scanned each layer.
  pub async fn layer_region_counts(&self) -> Result<Vec<(String, i64)>, StorageError> {
    let rows = sqlx::query("SELECT layer, COUNT(*) AS n FROM scanned_region_layers GROUP BY layer ORDER BY layer")
      .fetch_all(&self.pool)
      .await?;
    rows
      .iter()
      .map(|row| -> Result<(String, i64), StorageError> { Ok((row.try_get("layer")?, row.try_get("n")?)) })
      .collect()
  }
}
