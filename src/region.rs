//! Planar bounding-box geometry over decimal degrees.
//!
//! Overlap is computed on the raw lat/lon rectangle. Boxes that cross the
//! antimeridian are rejected rather than split, and areas near the poles are
//! not corrected for convergence of meridians.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MAX_ZOOM: u8 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub south: f64,
  pub west: f64,
  pub north: f64,
  pub east: f64,
}

impl BoundingBox {
  pub fn new(south: f64, west: f64, north: f64, east: f64) -> Result<Self, String> {
    for v in [south, west, north, east] {
      if !v.is_finite() {
        return Err("bbox bounds must be finite numbers".into());
      }
    }
    if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) {
      return Err(format!("latitude out of range in bbox: south={south}, north={north}"));
    }
    if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
      return Err(format!("longitude out of range in bbox: west={west}, east={east}"));
    }
    if south >= north {
      return Err(format!("bbox south ({south}) must be below north ({north})"));
    }
    if west >= east {
      return Err(format!("bbox west ({west}) must be below east ({east}); antimeridian boxes are not supported"));
    }
    Ok(Self { south, west, north, east })
  }

  /// Parses the `south,west,north,east` wire form.
  pub fn parse(raw: &str) -> Result<Self, String> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() != 4 {
      return Err(format!("bbox must be 'south,west,north,east', got '{raw}'"));
    }
    let mut nums = [0f64; 4];
    for (slot, part) in nums.iter_mut().zip(&parts) {
      *slot = part
        .parse::<f64>()
        .map_err(|_| format!("bbox component '{part}' is not a number"))?;
    }
    Self::new(nums[0], nums[1], nums[2], nums[3])
  }

  pub fn area(&self) -> f64 {
    (self.north - self.south) * (self.east - self.west)
  }

  pub fn intersects(&self, other: &BoundingBox) -> bool {
    self.south < other.north && self.north > other.south && self.west < other.east && self.east > other.west
  }

  pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
    if !self.intersects(other) {
      return None;
    }
    Some(BoundingBox {
      south: self.south.max(other.south),
      west: self.west.max(other.west),
      north: self.north.min(other.north),
      east: self.east.min(other.east),
    })
  }

  pub fn contains(&self, other: &BoundingBox) -> bool {
    self.south <= other.south && self.north >= other.north && self.west <= other.west && self.east >= other.east
  }

  pub fn contains_point(&self, lat: f64, lon: f64) -> bool {
    lat >= self.south && lat <= self.north && lon >= self.west && lon <= self.east
  }

  /// Fraction of `other` that lies inside `self`, in `[0, 1]`.
  pub fn coverage_of(&self, other: &BoundingBox) -> f64 {
    let area = other.area();
    if area <= 0.0 {
      return 0.0;
    }
    match self.intersection(other) {
      Some(overlap) => (overlap.area() / area).min(1.0),
      None => 0.0,
    }
  }

  pub fn union(&self, other: &BoundingBox) -> BoundingBox {
    BoundingBox {
      south: self.south.min(other.south),
      west: self.west.min(other.west),
      north: self.north.max(other.north),
      east: self.east.max(other.east),
    }
  }

  /// Stable textual key used for locks and logging.
  pub fn canonical_key(&self) -> String {
    format!("{:.6},{:.6},{:.6},{:.6}", self.south, self.west, self.north, self.east)
  }
}

impl fmt::Display for BoundingBox {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{},{},{},{}", self.south, self.west, self.north, self.east)
  }
}

impl FromStr for BoundingBox {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

pub fn validate_zoom(zoom: i64) -> Result<u8, String> {
  if (0..=MAX_ZOOM as i64).contains(&zoom) {
    Ok(zoom as u8)
  } else {
    Err(format!("zoom must be between 0 and {MAX_ZOOM}, got {zoom}"))
  }
}
