use std::fs;
use std::io::Write;
use std::path::Path;

use bikecast::{
    archive_ref, parse_trip_archive, plan_trip_archives, BackfillConfig, BackfillCoordinator,
    BackfillError, City, DataIntegrityError, FeatureConfig, FeatureStore, HourRange,
    LocalArchiveTripSource, Partition, Scenario, TripArchiveRequest, TripLoadError, TripSource,
    HOUR_MS,
};
use chrono::NaiveDate;
use regex::Regex;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

const MAR_5_MS: i64 = 1_709_596_800_000; // 2024-03-05T00:00:00Z
const MINUTE_MS: i64 = 60_000;
const JAN_1_MS: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z
const JAN_8_MS: i64 = JAN_1_MS + 7 * 24 * HOUR_MS;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dirs should be created");
    }
    let file = fs::File::create(path).expect("zip file should be created");
    let mut zip = zip::ZipWriter::new(file);
    for (name, body) in entries {
        zip.start_file(*name, SimpleFileOptions::default())
            .expect("zip entry should be created");
        zip.write_all(body.as_bytes())
            .expect("zip data should be written");
    }
    zip.finish().expect("zip should finalize");
}

fn divvy_march(data_root: &Path) {
    let csv = "\
ride_id,rideable_type,started_at,ended_at,start_station_name,start_station_id,end_station_name,end_station_id
R1,classic_bike,2024-03-05 08:15:00,2024-03-05 08:40:00,Clark & Lake,TA1,State & Madison,TA2
R2,electric_bike,2024-03-05 09:05:00,2024-03-05 10:10:00,State & Madison,TA2,Clark & Lake,TA1
R3,electric_bike,2024-03-05 09:30:00,2024-03-05 09:45:00,,,State & Madison,TA2
R4,classic_bike,not a time,2024-03-05 11:00:00,Clark & Lake,TA1,Clark & Lake,TA1
";
    let archive = archive_ref(City::Chicago, 2024, 3);
    write_zip(
        &data_root.join(&archive.relative_path),
        &[
            ("__MACOSX/._202403-divvy-tripdata.csv", "junk"),
            ("202403-divvy-tripdata.csv", csv),
        ],
    );
}

#[test]
fn local_archive_events_are_converted_to_utc() {
    let dir = TempDir::new().expect("tempdir");
    divvy_march(dir.path());
    let source = LocalArchiveTripSource::new(dir.path());

    let batch = source
        .fetch_events(City::Chicago, date(2024, 3, 5), date(2024, 3, 6))
        .expect("march archive loads");

    assert_eq!(batch.rows_read, 4);
    assert_eq!(batch.events.len(), 6);
    assert_eq!(batch.rejected_records, 2);
    assert!(batch
        .rejections
        .iter()
        .all(|r| matches!(r, DataIntegrityError::MalformedRecord { .. })));

    // Chicago is UTC-6 before the March DST switch.
    let r1_start = batch
        .events
        .iter()
        .find(|e| e.trip_id == "R1" && e.event_type == Scenario::Start)
        .expect("R1 start event");
    assert_eq!(r1_start.entity_id, "TA1");
    assert_eq!(r1_start.ts_ms_utc, MAR_5_MS + (14 * 60 + 15) * MINUTE_MS);

    // R3 has no start station but its end event is still usable.
    assert!(batch
        .events
        .iter()
        .any(|e| e.trip_id == "R3" && e.event_type == Scenario::End));
    assert!(!batch
        .events
        .iter()
        .any(|e| e.trip_id == "R3" && e.event_type == Scenario::Start));
}

#[test]
fn neighbouring_months_are_optional_but_requested_months_are_not() {
    let dir = TempDir::new().expect("tempdir");
    divvy_march(dir.path());
    let source = LocalArchiveTripSource::new(dir.path());

    source
        .fetch_events(City::Chicago, date(2024, 3, 2), date(2024, 3, 31))
        .expect("missing February and April are tolerated at the edges");

    let err = source
        .fetch_events(City::Chicago, date(2024, 2, 20), date(2024, 3, 5))
        .expect_err("February is part of the range");
    match err {
        TripLoadError::MissingArchive { path } => {
            assert!(path.ends_with("chicago/202402-divvy-tripdata.zip"))
        }
        other => panic!("unexpected error: {other}"),
    }
}

fn divvy_month(data_root: &Path, year: i32, month: u32, rows: &str) {
    let header = "ride_id,started_at,ended_at,start_station_id,end_station_id\n";
    let archive = archive_ref(City::Chicago, year, month);
    write_zip(
        &data_root.join(&archive.relative_path),
        &[(
            format!("{}.csv", archive.file_stem).as_str(),
            format!("{header}{rows}").as_str(),
        )],
    );
}

#[test]
fn first_utc_hours_of_a_month_require_the_previous_local_month() {
    let dir = TempDir::new().expect("tempdir");
    divvy_month(
        dir.path(),
        2024,
        1,
        "J1,2024-01-02 09:00:00,2024-01-02 09:20:00,TA1,TA2\n",
    );
    let source = LocalArchiveTripSource::new(dir.path());

    // 2024-01-01 00:00Z is 2023-12-31 18:00 in Chicago.
    let err = source
        .fetch_events(City::Chicago, date(2024, 1, 1), date(2024, 1, 8))
        .expect_err("December holds the first UTC hours");
    match err {
        TripLoadError::MissingArchive { path } => {
            assert!(path.ends_with("chicago/202312-divvy-tripdata.zip"))
        }
        other => panic!("unexpected error: {other}"),
    }

    divvy_month(
        dir.path(),
        2023,
        12,
        "D1,2023-12-31 20:30:00,2023-12-31 20:50:00,TA1,TA2\n",
    );
    let batch = source
        .fetch_events(City::Chicago, date(2024, 1, 1), date(2024, 1, 8))
        .expect("both months present");
    let spill = batch
        .events
        .iter()
        .find(|e| e.trip_id == "D1" && e.event_type == Scenario::Start)
        .expect("December trip is loaded");
    assert_eq!(spill.ts_ms_utc, JAN_1_MS + (2 * 60 + 30) * MINUTE_MS);
}

#[test]
fn feature_backfill_fails_instead_of_zero_filling_a_missing_local_month() {
    let dir = TempDir::new().expect("tempdir");
    divvy_month(
        dir.path(),
        2024,
        1,
        "J1,2024-01-02 09:00:00,2024-01-02 09:20:00,TA1,TA2\n",
    );
    let source = LocalArchiveTripSource::new(dir.path());
    let coordinator =
        BackfillCoordinator::new(BackfillConfig::new(City::Chicago)).expect("config is valid");
    let mut store = FeatureStore::open_in_memory().expect("store opens");

    let err = coordinator
        .backfill_features(
            &source,
            &mut store,
            &[Scenario::Start],
            date(2024, 1, 8),
            date(2024, 1, 8),
        )
        .expect_err("history reaches into December");
    assert!(matches!(
        err,
        BackfillError::Source(TripLoadError::MissingArchive { .. })
    ));
    assert!(store
        .entity_ids(Partition::Features, Scenario::Start)
        .unwrap()
        .is_empty());

    divvy_month(
        dir.path(),
        2023,
        12,
        "D1,2023-12-31 20:30:00,2023-12-31 20:50:00,TA1,TA2\n",
    );
    let report = coordinator
        .backfill_features(
            &source,
            &mut store,
            &[Scenario::Start],
            date(2024, 1, 8),
            date(2024, 1, 8),
        )
        .expect("december is available");
    assert!(!report.has_failures(), "{report:?}");

    let lag_week = FeatureConfig::default()
        .lag_hours
        .iter()
        .position(|lag| *lag == 168)
        .unwrap();
    let frame = store
        .read_features(
            Some(&["TA1".to_string()][..]),
            Scenario::Start,
            HourRange::new(JAN_8_MS + 2 * HOUR_MS, JAN_8_MS + 3 * HOUR_MS).unwrap(),
        )
        .expect("read");
    assert_eq!(frame.rows.len(), 1);
    assert_eq!(frame.rows[0].values[lag_week], 1.0);
}

#[test]
fn archive_without_csv_entry_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("chicago/202403-divvy-tripdata.zip");
    write_zip(&path, &[("readme.txt", "no trips here")]);

    assert!(matches!(
        parse_trip_archive(&path, City::Chicago),
        Err(TripLoadError::MissingCsvEntry { .. })
    ));
}

#[test]
fn legacy_citibike_headers_are_accepted() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("new_york/201907-citibike-tripdata.zip");
    let csv = "\
\"tripduration\",\"starttime\",\"stoptime\",\"start station id\",\"start station name\",\"end station id\",\"end station name\"
\"300\",\"2019-07-01 00:00:51.2940\",\"2019-07-01 00:05:51.3100\",\"3467\",\"W 15 St\",\"3218\",\"E 10 St\"
";
    write_zip(&path, &[("201907-citibike-tripdata.csv", csv)]);

    let batch = parse_trip_archive(&path, City::NewYork).expect("legacy archive parses");
    assert_eq!(batch.events.len(), 2);
    assert_eq!(batch.rejected_records, 0);
    assert_eq!(batch.events[0].entity_id, "3467");
    assert_eq!(batch.events[1].entity_id, "3218");
    assert_eq!(batch.events[0].trip_id, batch.events[1].trip_id);
}

#[test]
fn archive_urls_follow_the_published_layout() {
    let url = Regex::new(r"^https://divvy-tripdata\.s3\.amazonaws\.com/\d{6}-divvy-tripdata\.zip$")
        .unwrap();
    let plan = plan_trip_archives(
        &TripArchiveRequest {
            city: City::Chicago,
            year: 2023,
            months: None,
        },
        date(2024, 6, 1),
    )
    .expect("plan builds");

    assert_eq!(plan.len(), 12);
    assert!(plan.iter().all(|archive| url.is_match(&archive.url)));
    assert_eq!(plan[0].file_stem, "202301-divvy-tripdata");
}

#[test]
fn portland_after_2020_is_not_published() {
    let err = plan_trip_archives(
        &TripArchiveRequest {
            city: City::Portland,
            year: 2021,
            months: None,
        },
        date(2024, 6, 1),
    )
    .expect_err("no Portland data after 2020");
    assert!(matches!(
        err,
        TripLoadError::NotPublished {
            city: City::Portland,
            last_year: 2020
        }
    ));
}
