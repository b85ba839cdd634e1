//! Schedule descriptors for tasks.
//!
//! Supported forms:
//! - `manual`, `on_demand` or empty: never fires on its own
//! - `@every 30m` (units `s`, `m`, `h`, `d`)
//! - `@hourly`, `@daily`
//! - five-field cron where only minute and hour vary, e.g. `0 */3 * * *`

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
  minutes: Vec<u32>,
  hours: Vec<u32>,
  source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
  #[default]
  OnDemand,
  Every(Duration),
  Cron(CronSpec),
}

fn parse_field(field: &str, max: u32) -> Result<Vec<u32>, String> {
  let mut values = Vec::new();
  for part in field.split(',') {
    if part == "*" {
      values.extend(0..max);
    } else if let Some(step) = part.strip_prefix("*/") {
      let step: u32 = step.parse().map_err(|_| format!("invalid step '{part}'"))?;
      if step == 0 || step >= max {
        return Err(format!("step out of range in '{part}'"));
      }
      values.extend((0..max).step_by(step as usize));
    } else if let Some((lo, hi)) = part.split_once('-') {
      let lo: u32 = lo.parse().map_err(|_| format!("invalid range '{part}'"))?;
      let hi: u32 = hi.parse().map_err(|_| format!("invalid range '{part}'"))?;
      if lo > hi || hi >= max {
        return Err(format!("range out of bounds in '{part}'"));
      }
      values.extend(lo..=hi);
    } else {
      let value: u32 = part.parse().map_err(|_| format!("invalid value '{part}'"))?;
      if value >= max {
        return Err(format!("value {value} out of range (max {})", max - 1));
      }
      values.push(value);
    }
  }
  values.sort_unstable();
  values.dedup();
  Ok(values)
}

const MAX_INTERVAL_DAYS: i64 = 366;

fn parse_every(raw: &str) -> Result<Duration, String> {
  let raw = raw.trim();
  let split = raw
    .find(|c: char| !c.is_ascii_digit())
    .ok_or_else(|| format!("interval '{raw}' is missing a unit"))?;
  let (amount, unit) = raw.split_at(split);
  let amount: i64 = amount.parse().map_err(|_| format!("invalid interval '{raw}'"))?;
  if amount <= 0 {
    return Err(format!("interval '{raw}' must be positive"));
  }
  let interval = match unit {
    "s" => Duration::try_seconds(amount),
    "m" => Duration::try_minutes(amount),
    "h" => Duration::try_hours(amount),
    "d" => Duration::try_days(amount),
    other => return Err(format!("unknown interval unit '{other}'")),
  };
  match interval {
    Some(interval) if interval <= Duration::days(MAX_INTERVAL_DAYS) => Ok(interval),
    _ => Err(format!("interval '{raw}' exceeds {MAX_INTERVAL_DAYS} days")),
  }
}

impl CronSpec {
  fn parse(raw: &str) -> Result<Self, String> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 5 {
      return Err(format!("cron expression '{raw}' must have 5 fields"));
    }
    if fields[2..].iter().any(|f| *f != "*") {
      return Err(format!("cron expression '{raw}': only minute and hour fields may be restricted"));
    }
    Ok(Self {
      minutes: parse_field(fields[0], 60)?,
      hours: parse_field(fields[1], 24)?,
      source: fields.join(" "),
    })
  }

  fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = after.date_naive();
    for day in 0..=1 {
      let date = today + Duration::days(day);
      for hour in &self.hours {
        for minute in &self.minutes {
          let candidate = date.and_hms_opt(*hour, *minute, 0)?.and_utc();
          if candidate > after {
            return Some(candidate);
          }
        }
      }
    }
    None
  }
}

impl Schedule {
  /// Next fire time strictly after `after`; `None` for on-demand tasks.
  pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Schedule::OnDemand => None,
      Schedule::Every(interval) => after.checked_add_signed(*interval),
      Schedule::Cron(spec) => spec.next_after(after),
    }
  }

  /// Whether a task last started at `last_started` should fire at `now`.
  /// A scheduled task that has never run is due immediately.
  pub fn is_due(&self, last_started: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match (self, last_started) {
      (Schedule::OnDemand, _) => false,
      (_, None) => true,
      (_, Some(last)) => self.next_after(last).is_some_and(|next| next <= now),
    }
  }

  pub fn is_on_demand(&self) -> bool {
    matches!(self, Schedule::OnDemand)
  }
}

impl FromStr for Schedule {
  type Err = String;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    let raw = raw.trim();
    match raw {
      "" | "manual" | "on_demand" | "on-demand" => Ok(Schedule::OnDemand),
      "@hourly" => Ok(Schedule::Cron(CronSpec::parse("0 * * * *")?)),
      "@daily" => Ok(Schedule::Cron(CronSpec::parse("0 0 * * *")?)),
      _ => match raw.strip_prefix("@every") {
        Some(interval) => Ok(Schedule::Every(parse_every(interval)?)),
        None => Ok(Schedule::Cron(CronSpec::parse(raw)?)),
      },
    }
  }
}

impl TryFrom<String> for Schedule {
  type Error = String;

  fn try_from(raw: String) -> Result<Self, Self::Error> {
    raw.parse()
  }
}

impl From<Schedule> for String {
  fn from(schedule: Schedule) -> Self {
    schedule.to_string()
  }
}

impl fmt::Display for Schedule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Schedule::OnDemand => write!(f, "manual"),
      Schedule::Every(interval) => write!(f, "@every {}s", interval.num_seconds()),
      Schedule::Cron(spec) => write!(f, "{}", spec.source),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap()
  }

  #[test]
  fn parses_supported_forms() {
    assert_eq!("manual".parse::<Schedule>().unwrap(), Schedule::OnDemand);
    assert_eq!("".parse::<Schedule>().unwrap(), Schedule::OnDemand);
    assert_eq!("@every 30m".parse::<Schedule>().unwrap(), Schedule::Every(Duration::minutes(30)));
    assert!("@every 0h".parse::<Schedule>().is_err());
    assert!("@every 5w".parse::<Schedule>().is_err());
    assert!("0 0 1 * *".parse::<Schedule>().is_err());
    assert!("61 * * * *".parse::<Schedule>().is_err());
  }

  #[test]
  fn cron_next_fire_times() {
    let every_three: Schedule = "0 */3 * * *".parse().unwrap();
    assert_eq!(every_three.next_after(at(1, 15)), Some(at(3, 0)));
    assert_eq!(every_three.next_after(at(3, 0)), Some(at(6, 0)));

    let late = Utc.with_ymd_and_hms(2025, 3, 1, 23, 30, 0).unwrap();
    let next_day = Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap();
    assert_eq!(every_three.next_after(late), Some(next_day));

    let twice: Schedule = "15,45 6 * * *".parse().unwrap();
    assert_eq!(twice.next_after(at(6, 20)), Some(at(6, 45)));
    assert_eq!(twice.to_string(), "15,45 6 * * *");
  }

  #[test]
  fn due_when_next_fire_has_passed() {
    let hourly: Schedule = "@hourly".parse().unwrap();
    assert!(hourly.is_due(None, at(0, 1)));
    assert!(!hourly.is_due(Some(at(5, 0)), at(5, 59)));
    assert!(hourly.is_due(Some(at(5, 0)), at(6, 0)));
    assert!(!Schedule::OnDemand.is_due(None, at(6, 0)));

    let every: Schedule = "@every 2h".parse().unwrap();
    assert!(!every.is_due(Some(at(1, 0)), at(2, 59)));
    assert!(every.is_due(Some(at(1, 0)), at(3, 0)));
    assert_eq!(every.to_string(), "@every 7200s");
  }

  #[test]
  fn oversized_intervals_are_rejected() {
    assert!("@every 100000000d".parse::<Schedule>().is_err());
    assert!("@every 9223372036854775807s".parse::<Schedule>().is_err());
    assert!("@every 99999999999999999999h".parse::<Schedule>().is_err());
    assert_eq!("@every 366d".parse::<Schedule>().unwrap(), Schedule::Every(Duration::days(366)));
  }

  #[test]
  fn next_fire_past_the_calendar_is_none() {
    let yearly = Schedule::Every(Duration::days(366));
    assert_eq!(yearly.next_after(DateTime::<Utc>::MAX_UTC), None);
    assert!(!yearly.is_due(Some(DateTime::<Utc>::MAX_UTC), DateTime::<Utc>::MAX_UTC));
  }

  #[test]
  fn round_trips_through_serde_as_string() {
    let schedule: Schedule = serde_json::from_str("\"@daily\"").unwrap();
    assert_eq!(serde_json::to_string(&schedule).unwrap(), "\"0 0 * * *\"");
    assert!(serde_json::from_str::<Schedule>("\"bogus\"").is_err());
  }
}
