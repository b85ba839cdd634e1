mod common;

use chrono::Utc;
use common::{Script, ScriptedAdapter, context, fire, pm25};
use envcache::error::ScanError;
use envcache::models::ScanActor;
use envcache::region::BoundingBox;
use envcache::scan::ScanRequest;

fn request(layers: &[&str]) -> ScanRequest {
  ScanRequest {
    bbox: "59.5,10.5,60.0,11.0".into(),
    zoom: 10,
    layers: layers.iter().map(|s| s.to_string()).collect(),
  }
}

#[tokio::test]
async fn second_scan_within_window_is_served_from_cache() {
  let now = Utc::now();
  let fires = ScriptedAdapter::new("firms", "fires", Script::Records(vec![fire(59.7, 10.7, now, 12.0), fire(59.8, 10.8, now, 4.0)]));
  let air = ScriptedAdapter::new("openaq", "air", Script::Records(vec![pm25(59.9, 10.75, now, 8.0)]));
  let ctx = context(vec![fires.clone(), air.clone()]).await;

  let first = ctx.scans.scan(&request(&["fires", "air"]), ScanActor::User).await.unwrap();
  assert!(!first.cached);
  assert!(!first.partial_cache);
  assert_eq!(fires.calls(), 1);
  assert_eq!(air.calls(), 1);
  assert_eq!(first.fetch_results["fires"].records_stored, 2);
  assert!(first.fetch_results["air"].success);
  assert_eq!(first.data["fires"].len(), 2);
  assert_eq!(first.data["air"].len(), 1);

  let regions = ctx.cache.recent_regions(10).await.unwrap();
  assert_eq!(regions.len(), 1);
  let scanned: Vec<String> = regions[0].layers_scanned().into_iter().collect();
  assert_eq!(scanned, vec!["air".to_string(), "fires".to_string()]);
  assert_eq!(regions[0].data_points_cached, 3);

  let second = ctx.scans.scan(&request(&["fires", "air"]), ScanActor::User).await.unwrap();
  assert!(second.cached);
  assert!(second.fetch_results.is_empty());
  assert_eq!(fires.calls(), 1);
  assert_eq!(air.calls(), 1);
  assert_eq!(second.data["fires"].len(), 2);
}

#[tokio::test]
async fn one_failing_layer_does_not_sink_the_other() {
  let now = Utc::now();
  let fires = ScriptedAdapter::new("firms", "fires", Script::Records(vec![fire(59.7, 10.7, now, 12.0)]));
  let air = ScriptedAdapter::new("openaq", "air", Script::Fail("upstream down".into()));
  let ctx = context(vec![fires.clone(), air.clone()]).await;

  let response = ctx.scans.scan(&request(&["fires", "air"]), ScanActor::User).await.unwrap();
  assert!(response.fetch_results["fires"].success);
  let air_result = &response.fetch_results["air"];
  assert!(!air_result.success);
  assert!(air_result.error.as_deref().unwrap().contains("upstream down"));

  assert_eq!(ctx.store.counts_by_provider().await.unwrap(), vec![("firms".to_string(), 1)]);
  let regions = ctx.cache.recent_regions(10).await.unwrap();
  assert_eq!(regions[0].layers_scanned().into_iter().collect::<Vec<_>>(), vec!["fires".to_string()]);

  // air is still stale, fires is not fetched again
  air.set_script(Script::Records(vec![pm25(59.9, 10.75, now, 8.0)]));
  let retry = ctx.scans.scan(&request(&["fires", "air"]), ScanActor::User).await.unwrap();
  assert!(retry.partial_cache);
  assert_eq!(fires.calls(), 1);
  assert_eq!(air.calls(), 2);
  assert!(retry.fetch_results["air"].success);
}

#[tokio::test]
async fn busy_layer_reports_in_progress() {
  let fires = ScriptedAdapter::new("firms", "fires", Script::Records(vec![]));
  let ctx = context(vec![fires.clone()]).await;
  let bbox = BoundingBox::parse("59.5,10.5,60.0,11.0").unwrap();
  let _held = ctx.locks.try_acquire(format!("scan:{}:fires", bbox.canonical_key())).unwrap();

  let response = ctx.scans.scan(&request(&["fires"]), ScanActor::User).await.unwrap();
  let result = &response.fetch_results["fires"];
  assert!(!result.success);
  assert!(result.in_progress);
  assert_eq!(fires.calls(), 0);
  assert!(ctx.cache.recent_regions(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn prefetch_warms_the_cache() {
  let fires = ScriptedAdapter::new("firms", "fires", Script::Records(vec![fire(59.7, 10.7, Utc::now(), 1.0)]));
  let ctx = context(vec![fires.clone()]).await;

  let results = ctx.scans.prefetch(&request(&["fire"])).await.unwrap();
  assert!(results["fires"].success);
  let regions = ctx.cache.recent_regions(1).await.unwrap();
  assert_eq!(regions[0].actor, ScanActor::Prefetch);

  let response = ctx.scans.scan(&request(&["fires"]), ScanActor::User).await.unwrap();
  assert!(response.cached);
  assert_eq!(fires.calls(), 1);
}

#[tokio::test]
async fn layer_without_provider_fails_cleanly() {
  let ctx = context(vec![]).await;
  let response = ctx.scans.scan(&request(&["ocean"]), ScanActor::User).await.unwrap();
  assert!(!response.fetch_results["ocean"].success);
  assert!(response.data["ocean"].is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
  let ctx = context(vec![]).await;
  let cases = vec![
    ScanRequest { bbox: "60,10,59,11".into(), zoom: 10, layers: vec!["fires".into()] },
    ScanRequest { bbox: "59.5,10.5,60.0".into(), zoom: 10, layers: vec!["fires".into()] },
    ScanRequest { bbox: "59.5,10.5,60.0,11.0".into(), zoom: 23, layers: vec!["fires".into()] },
    ScanRequest { bbox: "59.5,10.5,60.0,11.0".into(), zoom: 10, layers: vec![] },
    ScanRequest { bbox: "59.5,10.5,60.0,11.0".into(), zoom: 10, layers: vec!["volcanoes".into()] },
  ];
  for case in cases {
    let err = ctx.scans.scan(&case, ScanActor::User).await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidRequest(_)), "{case:?} gave {err:?}");
  }
}

#[tokio::test]
async fn wide_scan_refetches_layer_only_seen_in_a_corner() {
  let now = Utc::now();
  let fires = ScriptedAdapter::new("firms", "fires", Script::Records(vec![fire(59.95, 10.95, now, 2.0)]));
  let air = ScriptedAdapter::new("openaq", "air", Script::Records(vec![pm25(59.5, 10.5, now, 8.0)]));
  let ctx = context(vec![fires.clone(), air.clone()]).await;
  let scan = |bbox: &str, layers: &[&str]| ScanRequest {
    bbox: bbox.into(),
    zoom: 10,
    layers: layers.iter().map(|s| s.to_string()).collect(),
  };

  ctx.scans.scan(&scan("59.9,10.9,60.0,11.0", &["fires"]), ScanActor::User).await.unwrap();
  ctx.scans.scan(&scan("59.0,10.0,60.0,11.0", &["air"]), ScanActor::User).await.unwrap();

  let wide = ctx.scans.scan(&scan("59.0,10.0,60.0,11.0", &["fires", "air"]), ScanActor::User).await.unwrap();
  assert!(wide.partial_cache);
  assert!(wide.fetch_results.contains_key("fires"));
  assert!(!wide.fetch_results.contains_key("air"));
  assert_eq!(fires.calls(), 2);
  assert_eq!(air.calls(), 1);
}
