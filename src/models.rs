use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::error::RecordError;
use crate::region::BoundingBox;

/// Location component of the natural key for readings without coordinates.
pub const NO_LOCATION: &str = "none";

/// One observed value from a provider, normalized.
///
/// `value` is `None` when the provider reported the reading without data; it
/// is stored as NULL and never coerced to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
  #[serde(default)]
  pub provider: String,
  #[serde(default)]
  pub metric: String,
  #[serde(default)]
  pub value: Option<f64>,
  #[serde(default)]
  pub unit: Option<String>,
  #[serde(default)]
  pub latitude: Option<f64>,
  #[serde(default)]
  pub longitude: Option<f64>,
  /// Event time of the observation, not the fetch time.
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub metadata: Map<String, Value>,
}

impl Measurement {
  pub fn new(provider: &str, metric: &str, timestamp: DateTime<Utc>) -> Self {
    Self {
      provider: provider.to_string(),
      metric: metric.to_string(),
      value: None,
      unit: None,
      latitude: None,
      longitude: None,
      timestamp,
      metadata: Map::new(),
    }
  }

  pub fn with_value(mut self, value: f64, unit: &str) -> Self {
    self.value = Some(value);
    self.unit = Some(unit.to_string());
    self
  }

  pub fn at(mut self, lat: f64, lon: f64) -> Self {
    self.latitude = Some(lat);
    self.longitude = Some(lon);
    self
  }

  /// Checks the key fields and returns the location component of the key.
  pub fn location_key(&self) -> Result<String, RecordError> {
    if self.provider.trim().is_empty() {
      return Err(RecordError::MissingProvider);
    }
    if self.metric.trim().is_empty() {
      return Err(RecordError::MissingMetric);
    }
    if let Some(v) = self.value {
      if !v.is_finite() {
        return Err(RecordError::NonFiniteValue);
      }
    }
    match (self.latitude, self.longitude) {
      (None, None) => Ok(NO_LOCATION.to_string()),
      (Some(lat), Some(lon)) => {
        if !lat.is_finite() || !lon.is_finite() || !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
          return Err(RecordError::OutOfRange { lat, lon });
        }
        // + 0.0 folds -0.0 into 0.0 so both spellings share a key
        Ok(format!("{:.6},{:.6}", lat + 0.0, lon + 0.0))
      }
      _ => Err(RecordError::PartialLocation),
    }
  }
}

/// Cuts `text` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_text(text: &str, max: usize) -> String {
  if text.chars().count() <= max {
    return text.to_string();
  }
  let mut cut: String = text.chars().take(max.saturating_sub(1)).collect();
  cut.push('…');
  cut
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
  pub index: usize,
  pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertResult {
  pub inserted: u64,
  pub updated: u64,
  pub rejected: Vec<RejectedRecord>,
}

impl UpsertResult {
  pub fn stored(&self) -> u64 {
    self.inserted + self.updated
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanActor {
  User,
  Scheduled,
  Prefetch,
}

impl ScanActor {
  pub fn as_str(&self) -> &'static str {
    match self {
      ScanActor::User => "user",
      ScanActor::Scheduled => "scheduled",
      ScanActor::Prefetch => "prefetch",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw {
      "user" => Some(ScanActor::User),
      "scheduled" => Some(ScanActor::Scheduled),
      "prefetch" => Some(ScanActor::Prefetch),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerScan {
  pub layer: String,
  pub last_scanned: DateTime<Utc>,
}

/// A record that an area was fetched for a set of layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScannedRegion {
  pub id: i64,
  pub bbox: BoundingBox,
  pub zoom: u8,
  pub first_scanned: DateTime<Utc>,
  pub last_updated: DateTime<Utc>,
  pub data_points_cached: i64,
  pub layers: Vec<LayerScan>,
  pub actor: ScanActor,
}

impl ScannedRegion {
  pub fn layers_scanned(&self) -> BTreeSet<String> {
    self.layers.iter().map(|l| l.layer.clone()).collect()
  }

  pub fn layer_scanned_at(&self, layer: &str) -> Option<DateTime<Utc>> {
    self.layers.iter().find(|l| l.layer == layer).map(|l| l.last_scanned)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FreshnessReport {
  pub fresh: BTreeSet<String>,
  pub stale: BTreeSet<String>,
}

impl FreshnessReport {
  pub fn all_fresh(&self) -> bool {
    self.stale.is_empty() && !self.fresh.is_empty()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoverageStats {
  pub total_regions: i64,
  pub total_data_points: i64,
  pub oldest_scan: Option<DateTime<Utc>>,
  pub newest_scan: Option<DateTime<Utc>>,
  pub avg_points_per_region: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
  Running,
  Completed,
  Failed,
}

impl RunStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunStatus::Running => "running",
      RunStatus::Completed => "completed",
      RunStatus::Failed => "failed",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw {
      "running" => Some(RunStatus::Running),
      "completed" => Some(RunStatus::Completed),
      "failed" => Some(RunStatus::Failed),
      _ => None,
    }
  }
}

/// Who asked for a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
  System,
  Schedule,
  Manual,
}

impl RunTrigger {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunTrigger::System => "system",
      RunTrigger::Schedule => "schedule",
      RunTrigger::Manual => "manual",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw {
      "system" => Some(RunTrigger::System),
      "schedule" => Some(RunTrigger::Schedule),
      "manual" => Some(RunTrigger::Manual),
      _ => None,
    }
  }

  pub fn scan_actor(&self) -> ScanActor {
    match self {
      RunTrigger::Manual => ScanActor::User,
      RunTrigger::System | RunTrigger::Schedule => ScanActor::Scheduled,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRun {
  pub id: Uuid,
  pub task_name: String,
  pub status: RunStatus,
  pub trigger: RunTrigger,
  pub started_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub records_processed: i64,
  pub output: Option<String>,
  pub error: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
  }

  #[test]
  fn location_key_covers_spatial_and_non_spatial() {
    let spatial = Measurement::new("firms", "fire_brightness", ts()).at(59.75, -0.0);
    assert_eq!(spatial.location_key().unwrap(), "59.750000,0.000000");

    let global = Measurement::new("noaa", "co2_ppm", ts());
    assert_eq!(global.location_key().unwrap(), NO_LOCATION);
  }

  #[test]
  fn malformed_records_are_refused() {
    let mut m = Measurement::new("", "pm25", ts());
    assert_eq!(m.location_key(), Err(RecordError::MissingProvider));

    m.provider = "openaq".into();
    m.metric = " ".into();
    assert_eq!(m.location_key(), Err(RecordError::MissingMetric));

    m.metric = "pm25".into();
    m.latitude = Some(10.0);
    assert_eq!(m.location_key(), Err(RecordError::PartialLocation));

    m.longitude = Some(200.0);
    assert!(matches!(m.location_key(), Err(RecordError::OutOfRange { .. })));

    let nan = Measurement::new("openaq", "pm25", ts()).with_value(f64::NAN, "ug/m3");
    assert_eq!(nan.location_key(), Err(RecordError::NonFiniteValue));
  }

  #[test]
  fn truncation_respects_char_boundaries() {
    assert_eq!(truncate_text("short", 10), "short");
    assert_eq!(truncate_text("ååååå", 3), "åå…");
    assert_eq!(truncate_text("abcdef", 3).chars().count(), 3);
  }

  #[test]
  fn missing_value_deserializes_as_none() {
    let m: Measurement = serde_json::from_str(
      r#"{"provider":"openaq","metric":"pm25","timestamp":"2025-03-01T12:00:00Z","latitude":59.9,"longitude":10.7}"#,
    ).unwrap();
    assert_eq!(m.value, None);
    assert_eq!(m.timestamp, ts());
  }
}
