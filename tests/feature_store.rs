use std::thread;

use bikecast::{
    build_feature_schema, FeatureConfig, FeatureRow, FeatureSchema, FeatureStore, HourRange,
    Partition, PredictionRow, Scenario, StoreError, FEATURE_SCHEMA_VERSION, HOUR_MS,
};
use tempfile::TempDir;

const START_TS_MS: i64 = 1_709_251_200_000; // 2024-03-01T00:00:00Z

fn schema() -> FeatureSchema {
    build_feature_schema(&FeatureConfig {
        lag_hours: vec![1],
        rolling_windows_hours: vec![],
        include_calendar: false,
        forecast_hours: 0,
        schema_version: FEATURE_SCHEMA_VERSION,
    })
}

fn rows(entity: &str, first_hour: i64, hours: i64, base: f64) -> Vec<FeatureRow> {
    (0..hours)
        .map(|idx| FeatureRow {
            entity_id: entity.to_string(),
            scenario: Scenario::Start,
            hour_ts_ms_utc: START_TS_MS + (first_hour + idx) * HOUR_MS,
            values: vec![base + idx as f64],
            target: Some((base as u32) + idx as u32),
        })
        .collect()
}

fn range(first_hour: i64, hours: i64) -> HourRange {
    HourRange::new(
        START_TS_MS + first_hour * HOUR_MS,
        START_TS_MS + (first_hour + hours) * HOUR_MS,
    )
    .expect("aligned range")
}

#[test]
fn upserting_twice_leaves_the_same_state() {
    let mut store = FeatureStore::open_in_memory().expect("store opens");
    let schema = schema();
    let batch = rows("A", 0, 24, 1.0);

    store.upsert_features(&batch, &schema).expect("first upsert");
    let once = store
        .read_features(None, Scenario::Start, range(0, 24))
        .expect("read after first upsert");
    store.upsert_features(&batch, &schema).expect("second upsert");
    let twice = store
        .read_features(None, Scenario::Start, range(0, 24))
        .expect("read after second upsert");

    assert_eq!(once, twice);
    assert_eq!(twice.rows.len(), 24);
    assert_eq!(twice.schema.as_ref(), Some(&schema));
    assert_eq!(
        store
            .count_range(Partition::Features, Scenario::Start, range(0, 48))
            .unwrap(),
        24
    );
}

#[test]
fn shifted_overlap_only_rewrites_overlapping_keys() {
    let mut store = FeatureStore::open_in_memory().expect("store opens");
    let schema = schema();
    store
        .upsert_features(&rows("A", 0, 10, 0.0), &schema)
        .expect("first window");
    store
        .upsert_features(&rows("A", 5, 10, 100.0), &schema)
        .expect("shifted window");

    let frame = store
        .read_features(None, Scenario::Start, range(0, 15))
        .expect("read");
    assert_eq!(frame.rows.len(), 15);
    let values: Vec<f64> = frame.rows.iter().map(|r| r.values[0]).collect();
    assert_eq!(&values[..5], &[0.0, 1.0, 2.0, 3.0, 4.0]);
    let shifted: Vec<f64> = (0..10).map(|idx| 100.0 + idx as f64).collect();
    assert_eq!(&values[5..], shifted.as_slice());
}

#[test]
fn never_written_keys_are_absent_while_zero_counts_are_kept() {
    let mut store = FeatureStore::open_in_memory().expect("store opens");
    let schema = schema();
    let mut batch = rows("A", 0, 3, 0.0);
    batch.remove(1);
    store.upsert_features(&batch, &schema).expect("upsert");

    let frame = store
        .read_features(None, Scenario::Start, range(0, 3))
        .expect("read");
    let hours: Vec<i64> = frame.rows.iter().map(|r| r.hour_ts_ms_utc).collect();
    assert_eq!(hours, vec![START_TS_MS, START_TS_MS + 2 * HOUR_MS]);
    assert_eq!(frame.rows[0].target, Some(0));

    let empty = store
        .read_features(None, Scenario::End, range(0, 3))
        .expect("read other scenario");
    assert!(empty.rows.is_empty());
    assert!(empty.schema.is_none());
}

#[test]
fn reads_are_ordered_by_entity_then_hour_and_filterable() {
    let mut store = FeatureStore::open_in_memory().expect("store opens");
    let schema = schema();
    let mut batch = rows("B", 0, 3, 0.0);
    batch.extend(rows("A", 0, 3, 10.0));
    batch.reverse();
    store.upsert_features(&batch, &schema).expect("upsert");

    let frame = store
        .read_features(None, Scenario::Start, range(0, 3))
        .expect("read");
    let keys: Vec<(&str, i64)> = frame
        .rows
        .iter()
        .map(|r| (r.entity_id.as_str(), (r.hour_ts_ms_utc - START_TS_MS) / HOUR_MS))
        .collect();
    assert_eq!(
        keys,
        vec![("A", 0), ("A", 1), ("A", 2), ("B", 0), ("B", 1), ("B", 2)]
    );

    let only_b = store
        .read_features(Some(&["B".to_string()][..]), Scenario::Start, range(1, 1))
        .expect("filtered read");
    assert_eq!(only_b.rows.len(), 1);
    assert_eq!(only_b.rows[0].values, vec![1.0]);
}

#[test]
fn feature_and_prediction_partitions_do_not_collide() {
    let mut store = FeatureStore::open_in_memory().expect("store opens");
    store
        .upsert_features(&rows("A", 0, 2, 0.0), &schema())
        .expect("features");
    let predictions: Vec<PredictionRow> = (0..2)
        .map(|idx| PredictionRow {
            entity_id: "A".to_string(),
            scenario: Scenario::Start,
            hour_ts_ms_utc: START_TS_MS + idx * HOUR_MS,
            predicted_count: 1.5,
            artifact_id: "artifact".to_string(),
        })
        .collect();
    store.upsert_predictions(&predictions).expect("predictions");

    assert_eq!(
        store
            .read_predictions(None, Scenario::Start, range(0, 2))
            .unwrap(),
        predictions
    );
    assert_eq!(
        store
            .read_features(None, Scenario::Start, range(0, 2))
            .unwrap()
            .rows
            .len(),
        2
    );
    assert_eq!(
        store.entity_ids(Partition::Predictions, Scenario::Start).unwrap(),
        vec!["A".to_string()]
    );
}

#[test]
fn mixed_schemas_in_one_read_are_reported() {
    let mut store = FeatureStore::open_in_memory().expect("store opens");
    store
        .upsert_features(&rows("A", 0, 2, 0.0), &schema())
        .expect("lag schema");

    let other = build_feature_schema(&FeatureConfig {
        lag_hours: vec![2],
        ..FeatureConfig::default()
    });
    let wide: Vec<FeatureRow> = rows("B", 0, 2, 0.0)
        .into_iter()
        .map(|mut row| {
            row.values = vec![0.0; other.columns.len()];
            row
        })
        .collect();
    store.upsert_features(&wide, &other).expect("second schema");

    assert!(matches!(
        store.read_features(None, Scenario::Start, range(0, 2)),
        Err(StoreError::MixedSchemas(2))
    ));
}

#[test]
fn parallel_writers_on_disjoint_entities_all_land() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("chicago").join("feature_store.sqlite");
    FeatureStore::open(&path).expect("store initializes");

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let path = path.clone();
            thread::spawn(move || {
                let mut store = FeatureStore::open(&path).expect("worker opens store");
                let entity = format!("station-{worker}");
                store
                    .upsert_features(&rows(&entity, 0, 48, worker as f64), &schema())
                    .expect("worker upsert")
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().expect("worker finishes"), 48);
    }

    let store = FeatureStore::open(&path).expect("reopen");
    assert_eq!(
        store
            .count_range(Partition::Features, Scenario::Start, range(0, 48))
            .unwrap(),
        4 * 48
    );
    assert_eq!(store.entity_ids(Partition::Features, Scenario::Start).unwrap().len(), 4);
}
