mod common;

use common::{fire, pm25, ts};
use envcache::database::memory_database;
use envcache::models::Measurement;
use envcache::region::BoundingBox;
use envcache::store::MeasurementStore;
use serde_json::json;
use tokio_test::assert_ok;

async fn store() -> MeasurementStore {
  MeasurementStore::new(memory_database().await.unwrap())
}

#[tokio::test]
async fn repeated_upsert_is_idempotent() {
  let store = store().await;
  let batch = vec![fire(59.7, 10.7, ts(10, 0), 12.5), fire(59.8, 10.9, ts(10, 0), 3.0)];

  let first = assert_ok!(store.upsert(&batch).await);
  assert_eq!((first.inserted, first.updated), (2, 0));

  let second = assert_ok!(store.upsert(&batch).await);
  assert_eq!((second.inserted, second.updated), (0, 2));
  assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn natural_key_is_unique_and_last_write_wins() {
  let store = store().await;
  store.upsert(&[fire(59.7, 10.7, ts(10, 0), 12.5)]).await.unwrap();
  store.upsert(&[fire(59.7, 10.7, ts(10, 0), 20.0)]).await.unwrap();
  // same place, different time: a new row
  store.upsert(&[fire(59.7, 10.7, ts(11, 0), 1.0)]).await.unwrap();

  let bbox = BoundingBox::new(59.5, 10.5, 60.0, 11.0).unwrap();
  let rows = store.query_region(&bbox, &["firms".to_string()], 100).await.unwrap();
  assert_eq!(rows.len(), 2);
  assert_eq!(rows[0].timestamp, ts(11, 0));
  assert_eq!(rows[1].value, Some(20.0));
}

#[tokio::test]
async fn malformed_records_are_rejected_individually() {
  let store = store().await;
  let mut partial = pm25(59.9, 10.7, ts(9, 0), 4.0);
  partial.longitude = None;
  let batch = vec![
    pm25(59.9, 10.7, ts(9, 0), 4.0),
    Measurement::new("", "pm25", ts(9, 0)),
    partial,
    pm25(95.0, 10.7, ts(9, 0), 4.0),
  ];

  let result = store.upsert(&batch).await.unwrap();
  assert_eq!(result.inserted, 1);
  let rejected: Vec<usize> = result.rejected.iter().map(|r| r.index).collect();
  assert_eq!(rejected, vec![1, 2, 3]);
  assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn absent_values_stay_absent() {
  let store = store().await;
  let mut reading = Measurement::new("gbif", "occurrence", ts(8, 0)).at(59.6, 10.6);
  reading.metadata = json!({"species": "Lynx lynx"}).as_object().cloned().unwrap();
  store.upsert(&[reading.clone()]).await.unwrap();

  let bbox = BoundingBox::new(59.5, 10.5, 60.0, 11.0).unwrap();
  let rows = store.query_region(&bbox, &["gbif".to_string()], 10).await.unwrap();
  assert_eq!(rows, vec![reading]);
  assert_eq!(rows[0].value, None);
}

#[tokio::test]
async fn non_spatial_readings_share_the_no_location_key() {
  let store = store().await;
  let global = Measurement::new("noaa", "co2_ppm", ts(0, 0)).with_value(424.1, "ppm");
  store.upsert(&[global.clone()]).await.unwrap();
  let again = store.upsert(&[global.with_value(424.3, "ppm")]).await.unwrap();
  assert_eq!(again.updated, 1);
  assert_eq!(store.counts_by_provider().await.unwrap(), vec![("noaa".to_string(), 1)]);
}

#[tokio::test]
async fn latest_timestamp_tracks_newest_event() {
  let store = store().await;
  assert_eq!(store.latest_timestamp("openaq", "pm25").await.unwrap(), None);

  store
    .upsert(&[pm25(59.9, 10.7, ts(9, 0), 4.0), pm25(59.9, 10.7, ts(12, 30), 6.0), pm25(59.9, 10.7, ts(11, 0), 5.0)])
    .await
    .unwrap();
  assert_eq!(store.latest_timestamp("openaq", "pm25").await.unwrap(), Some(ts(12, 30)));
  assert_eq!(store.latest_timestamp("openaq", "no2").await.unwrap(), None);
}

#[tokio::test]
async fn empty_coverage_has_zero_average() {
  let store = store().await;
  let stats = store.coverage_stats().await.unwrap();
  assert_eq!(stats.total_regions, 0);
  assert_eq!(stats.avg_points_per_region, 0.0);
  assert_eq!(stats.oldest_scan, None);
}

#[tokio::test]
async fn storage_failure_rolls_back_the_whole_batch() {
  let store = store().await;
  store.upsert(&[fire(59.7, 10.7, ts(10, 0), 12.5)]).await.unwrap();
  sqlx::query(
    "CREATE TRIGGER refuse_pm25 BEFORE INSERT ON measurements WHEN NEW.metric = 'pm25' \
     BEGIN SELECT RAISE(ABORT, 'disk full'); END",
  )
  .execute(store.pool())
  .await
  .unwrap();

  let batch = vec![
    fire(59.7, 10.7, ts(10, 0), 99.0),
    fire(59.8, 10.8, ts(10, 0), 1.0),
    pm25(59.9, 10.9, ts(10, 0), 8.0),
  ];
  let err = store.upsert(&batch).await.unwrap_err();
  assert!(err.to_string().contains("disk full"), "{err}");

  assert_eq!(store.count().await.unwrap(), 1);
  let bbox = BoundingBox::new(59.5, 10.5, 60.0, 11.0).unwrap();
  let rows = store.query_region(&bbox, &["firms".to_string()], 10).await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].value, Some(12.5));
}
