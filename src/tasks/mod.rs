//! Named fetch tasks: definitions, schedules, run history and the runner.

pub mod history;
pub mod registry;
pub mod runner;
pub mod schedule;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::adapters::{GLOBAL_SCOPE, RegionSelector};
use crate::region::{BoundingBox, validate_zoom};

pub use history::{TaskHistory, TaskRunSummary};
pub use registry::TaskRegistry;
pub use runner::{RunOutcome, RunSettings, TaskRunner};
pub use schedule::Schedule;

const DEFAULT_ZOOM: u8 = 8;

fn default_active() -> bool {
  true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
  pub name: String,
  #[serde(default)]
  pub description: String,
  /// Key of the adapter this task invokes.
  pub provider: String,
  #[serde(default)]
  pub schedule: Schedule,
  #[serde(default = "default_active")]
  pub active: bool,
  /// Default [`TaskParams`], as a JSON object.
  #[serde(default)]
  pub params: Map<String, Value>,
}

impl TaskDefinition {
  pub fn new(name: &str, provider: &str) -> Self {
    Self {
      name: name.to_string(),
      description: String::new(),
      provider: provider.to_string(),
      schedule: Schedule::OnDemand,
      active: true,
      params: Map::new(),
    }
  }
}

/// Ten years.
pub const MAX_LOOKBACK_HOURS: i64 = 10 * 366 * 24;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskParams {
  /// `south,west,north,east`; mutually exclusive with `scope`.
  pub region: Option<String>,
  pub scope: Option<String>,
  pub zoom: Option<i64>,
  pub lookback_hours: Option<i64>,
  /// Fetch only what is newer than the latest stored reading of this metric.
  pub incremental_metric: Option<String>,
}

impl TaskParams {
  /// Overlays `overrides` onto `defaults` key by key and decodes the result.
  pub fn resolve(defaults: &Map<String, Value>, overrides: Option<&Map<String, Value>>) -> Result<Self, String> {
    let mut merged = defaults.clone();
    if let Some(overrides) = overrides {
      for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
      }
    }
    let params: TaskParams = serde_json::from_value(Value::Object(merged)).map_err(|e| e.to_string())?;
    if let Some(hours) = params.lookback_hours {
      if hours <= 0 || hours > MAX_LOOKBACK_HOURS {
        return Err(format!("lookback_hours must be between 1 and {MAX_LOOKBACK_HOURS}, got {hours}"));
      }
    }
    Ok(params)
  }

  pub fn selector(&self) -> Result<RegionSelector, String> {
    match (&self.region, &self.scope) {
      (Some(_), Some(_)) => Err("region and scope are mutually exclusive".into()),
      (Some(region), None) => {
        let bbox = BoundingBox::parse(region)?;
        let zoom = match self.zoom {
          Some(zoom) => validate_zoom(zoom)?,
          None => DEFAULT_ZOOM,
        };
        Ok(RegionSelector::Area { bbox, zoom })
      }
      (None, scope) => Ok(RegionSelector::Global(scope.clone().unwrap_or_else(|| GLOBAL_SCOPE.to_string()))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn overrides_replace_defaults_per_key() {
    let defaults = object(json!({"region": "59.5,10.5,60.0,11.0", "zoom": 10, "lookback_hours": 24}));
    let overrides = object(json!({"lookback_hours": 6}));
    let params = TaskParams::resolve(&defaults, Some(&overrides)).unwrap();
    assert_eq!(params.lookback_hours, Some(6));
    assert_eq!(params.zoom, Some(10));

    match params.selector().unwrap() {
      RegionSelector::Area { bbox, zoom } => {
        assert_eq!(zoom, 10);
        assert_eq!(bbox.north, 60.0);
      }
      other => panic!("unexpected selector {other:?}"),
    }
  }

  #[test]
  fn global_scope_is_the_default_selector() {
    let params = TaskParams::resolve(&Map::new(), None).unwrap();
    assert_eq!(params.selector().unwrap(), RegionSelector::Global("global".into()));
  }

  #[test]
  fn rejects_bad_params() {
    let unknown = object(json!({"regoin": "1,2,3,4"}));
    assert!(TaskParams::resolve(&unknown, None).is_err());

    let negative = object(json!({"lookback_hours": -3}));
    assert!(TaskParams::resolve(&negative, None).is_err());
    let huge = object(json!({"lookback_hours": i64::MAX}));
    assert!(TaskParams::resolve(&huge, None).is_err());

    let both = TaskParams { region: Some("0,0,1,1".into()), scope: Some("global".into()), ..Default::default() };
    assert!(both.selector().is_err());
  }

  #[test]
  fn definition_defaults_from_catalog_form() {
    let def: TaskDefinition = serde_json::from_value(json!({"name": "fires_nordic", "provider": "firms"})).unwrap();
    assert!(def.active);
    assert!(def.schedule.is_on_demand());
    assert!(def.params.is_empty());
  }
}
