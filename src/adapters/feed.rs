//! Adapter for providers that already publish normalized JSON.
//!
//! The feed is queried with `bbox=south,west,north,east&zoom=N` for area
//! selectors or `scope=NAME` for global ones, plus `since` (RFC 3339) for
//! incremental fetches, and must answer with a JSON array of measurements.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::debug;

use super::{ProviderAdapter, RegionSelector};
use crate::error::AdapterError;
use crate::models::{Measurement, truncate_text};

// delays of 2^n * 100ms: 200ms, 400ms, ...
const RETRY_BASE: u64 = 2;
const RETRY_FACTOR: u64 = 100;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRIES: usize = 2;
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Clone)]
pub struct FeedAdapter {
  key: String,
  layer: String,
  url: String,
  extra_query: BTreeMap<String, String>,
  client: reqwest::Client,
  retries: usize,
}

impl FeedAdapter {
  pub fn new(key: &str, layer: &str, url: &str, request_timeout: Duration) -> Result<Self, AdapterError> {
    let client = reqwest::Client::builder()
      .timeout(request_timeout)
      .user_agent(concat!("envcache/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self {
      key: key.to_string(),
      layer: layer.to_string(),
      url: url.to_string(),
      extra_query: BTreeMap::new(),
      client,
      retries: MAX_RETRIES,
    })
  }

  /// Static query parameters sent with every request (API keys, product ids).
  pub fn with_query(mut self, extra_query: BTreeMap<String, String>) -> Self {
    self.extra_query = extra_query;
    self
  }

  pub fn with_retries(mut self, retries: usize) -> Self {
    self.retries = retries;
    self
  }

  fn query_for(&self, selector: &RegionSelector, since: Option<DateTime<Utc>>) -> Vec<(String, String)> {
    let mut query: Vec<(String, String)> = self.extra_query.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    match selector {
      RegionSelector::Global(scope) => query.push(("scope".into(), scope.clone())),
      RegionSelector::Area { bbox, zoom } => {
        query.push(("bbox".into(), bbox.to_string()));
        query.push(("zoom".into(), zoom.to_string()));
      }
    }
    if let Some(since) = since {
      query.push(("since".into(), since.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
    query
  }

  async fn fetch_once(&self, query: &[(String, String)]) -> Result<Vec<Measurement>, AdapterError> {
    let response = self.client.get(&self.url).query(query).send().await?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(AdapterError::Status { status: status.as_u16(), body: truncate_text(&body, MAX_ERROR_BODY) });
    }
    Ok(response.json::<Vec<Measurement>>().await?)
  }
}

#[async_trait]
impl ProviderAdapter for FeedAdapter {
  fn key(&self) -> &str {
    &self.key
  }

  fn layer(&self) -> &str {
    &self.layer
  }

  async fn fetch(
    &self,
    selector: &RegionSelector,
    since: Option<DateTime<Utc>>,
  ) -> Result<Vec<Measurement>, AdapterError> {
    let query = self.query_for(selector, since);
    let strategy = ExponentialBackoff::from_millis(RETRY_BASE)
      .factor(RETRY_FACTOR)
      .max_delay(RETRY_MAX_DELAY)
      .take(self.retries);
    let mut records = RetryIf::spawn(
      strategy,
      || self.fetch_once(&query),
      |e: &AdapterError| e.is_transient(),
    )
      .await?;

    for record in &mut records {
      if record.provider.trim().is_empty() {
        record.provider = self.key.clone();
      }
    }
    debug!(provider = %self.key, url = %self.url, records = records.len(), "Feed fetched");
    Ok(records)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::region::BoundingBox;
  use chrono::TimeZone;

  #[test]
  fn query_carries_selector_and_since() {
    let adapter = FeedAdapter::new("firms", "fires", "http://localhost/feed", Duration::from_secs(5))
      .unwrap()
      .with_query(BTreeMap::from([("source".to_string(), "VIIRS".to_string())]));
    let bbox = BoundingBox::new(59.5, 10.5, 60.0, 11.0).unwrap();
    let since = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

    let query = adapter.query_for(&RegionSelector::Area { bbox, zoom: 10 }, Some(since));
    assert_eq!(
      query,
      vec![
        ("source".to_string(), "VIIRS".to_string()),
        ("bbox".to_string(), "59.5,10.5,60,11".to_string()),
        ("zoom".to_string(), "10".to_string()),
        ("since".to_string(), "2025-03-01T00:00:00Z".to_string()),
      ]
    );

    let global = adapter.query_for(&RegionSelector::Global("global".into()), None);
    assert_eq!(global.last(), Some(&("scope".to_string(), "global".to_string())));
  }
}
