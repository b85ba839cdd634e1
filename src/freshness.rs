use chrono::Duration;
use std::collections::HashMap;
use tracing::warn;

pub const FIRES: &str = "fires";
pub const AIR: &str = "air";
pub const WEATHER: &str = "weather";
pub const OCEAN: &str = "ocean";
pub const BIODIVERSITY: &str = "biodiversity";

/// Maximum staleness tolerated per logical layer.
#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
  windows: HashMap<String, Duration>,
}

impl Default for FreshnessPolicy {
  fn default() -> Self {
    let windows = [
      (FIRES, Duration::hours(3)),
      (AIR, Duration::hours(12)),
      (WEATHER, Duration::hours(6)),
      (OCEAN, Duration::days(7)),
      (BIODIVERSITY, Duration::days(30)),
    ]
    .into_iter()
    .map(|(layer, window)| (layer.to_string(), window))
    .collect();
    Self { windows }
  }
}

impl FreshnessPolicy {
  /// Maps the alternate spellings callers use onto the canonical layer name.
  pub fn canonical_layer(layer: &str) -> String {
    let lower = layer.trim().to_ascii_lowercase();
    match lower.as_str() {
      "air_quality" | "airquality" | "aq" => AIR.to_string(),
      "marine" => OCEAN.to_string(),
      "fire" => FIRES.to_string(),
      _ => lower,
    }
  }

  pub fn window(&self, layer: &str) -> Option<Duration> {
    self.windows.get(&Self::canonical_layer(layer)).copied()
  }

  pub fn knows(&self, layer: &str) -> bool {
    self.window(layer).is_some()
  }

  /// Replaces (or adds) the window for one layer.
  pub fn set_window(&mut self, layer: &str, window: Duration) {
    self.windows.insert(Self::canonical_layer(layer), window);
  }

  /// A window of `secs` seconds, or `None` when it is zero or beyond what
  /// chrono can represent.
  pub fn window_from_secs(secs: u64) -> Option<Duration> {
    let secs = i64::try_from(secs).ok().filter(|s| *s > 0)?;
    Duration::try_seconds(secs)
  }

  pub fn with_overrides(mut self, overrides: &HashMap<String, u64>) -> Self {
    for (layer, secs) in overrides {
      match Self::window_from_secs(*secs) {
        Some(window) => self.set_window(layer, window),
        None => warn!(layer = %layer, secs, "Ignoring out-of-range freshness window"),
      }
    }
    self
  }

  pub fn layers(&self) -> Vec<String> {
    let mut layers: Vec<String> = self.windows.keys().cloned().collect();
    layers.sort();
    layers
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_windows() {
    let policy = FreshnessPolicy::default();
    assert_eq!(policy.window("fires"), Some(Duration::hours(3)));
    assert_eq!(policy.window("air_quality"), Some(Duration::hours(12)));
    assert_eq!(policy.window("Marine"), Some(Duration::days(7)));
    assert_eq!(policy.window("weather"), Some(Duration::hours(6)));
    assert_eq!(policy.window("biodiversity"), Some(Duration::days(30)));
    assert!(!policy.knows("seismic"));
  }

  #[test]
  fn overrides_replace_single_layers() {
    let overrides = HashMap::from([("fires".to_string(), 600u64), ("seismic".to_string(), 60u64)]);
    let policy = FreshnessPolicy::default().with_overrides(&overrides);
    assert_eq!(policy.window("fires"), Some(Duration::minutes(10)));
    assert_eq!(policy.window("seismic"), Some(Duration::minutes(1)));
    assert_eq!(policy.window("air"), Some(Duration::hours(12)));
  }

  #[test]
  fn out_of_range_overrides_are_ignored() {
    assert_eq!(FreshnessPolicy::window_from_secs(0), None);
    assert_eq!(FreshnessPolicy::window_from_secs(u64::MAX), None);
    assert_eq!(FreshnessPolicy::window_from_secs(i64::MAX as u64), None);
    assert_eq!(FreshnessPolicy::window_from_secs(60), Some(Duration::minutes(1)));

    let overrides = HashMap::from([("fires".to_string(), u64::MAX)]);
    let policy = FreshnessPolicy::default().with_overrides(&overrides);
    assert_eq!(policy.window("fires"), Some(Duration::hours(3)));
  }
}
