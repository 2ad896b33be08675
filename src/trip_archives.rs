//! Monthly trip archives published by Lyft-operated systems: planning, download and parsing.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, TimeDelta, TimeZone};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::normalize::{DataIntegrityError, RawTripEvent};
use crate::{City, Scenario};

const MAX_REPORTED_REJECTIONS: usize = 256;

const DATETIME_FORMATS: [&str; 7] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const TRIP_ID_COLUMNS: [&str; 4] = ["ride_id", "trip_id", "tripid", "rental_id"];
const START_TIME_COLUMNS: [&str; 4] = ["started_at", "starttime", "start_time", "start_date"];
const END_TIME_COLUMNS: [&str; 5] = ["ended_at", "stoptime", "stop_time", "end_time", "end_date"];
const START_STATION_COLUMNS: [&str; 4] = [
    "start_station_id",
    "from_station_id",
    "start_station_number",
    "start_station_code",
];
const END_STATION_COLUMNS: [&str; 4] = [
    "end_station_id",
    "to_station_id",
    "end_station_number",
    "end_station_code",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripArchiveRef {
    pub city: City,
    pub year: i32,
    pub month: u32,
    pub file_stem: String,
    pub url: String,
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalArchiveSource {
    Cached,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTripArchive {
    pub archive: TripArchiveRef,
    pub local_path: PathBuf,
    pub source: LocalArchiveSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripArchiveRequest {
    pub city: City,
    pub year: i32,
    /// `None` means every published month of the year.
    pub months: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripArchiveConfig {
    pub data_root: PathBuf,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for TripArchiveConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/raw"),
            http_timeout_ms: 60_000,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

/// Events parsed from one or more archives plus the rows that could not be used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripBatch {
    pub events: Vec<RawTripEvent>,
    pub rows_read: u64,
    pub rejected_records: u64,
    pub rejections: Vec<DataIntegrityError>,
}

impl TripBatch {
    fn absorb(&mut self, mut other: TripBatch) {
        self.events.append(&mut other.events);
        self.rows_read += other.rows_read;
        self.rejected_records += other.rejected_records;
        for rejection in other.rejections {
            if self.rejections.len() >= MAX_REPORTED_REJECTIONS {
                break;
            }
            self.rejections.push(rejection);
        }
    }

    fn reject(&mut self, rejection: DataIntegrityError) {
        self.rejected_records += 1;
        if self.rejections.len() < MAX_REPORTED_REJECTIONS {
            self.rejections.push(rejection);
        }
    }
}

#[derive(Debug, Error)]
pub enum TripLoadError {
    #[error("invalid trip archive request: {0}")]
    InvalidRequest(String),
    #[error("Lyft doesn't provide data on {city} after {last_year}")]
    NotPublished { city: City, last_year: i32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("archive at {path} has no entries")]
    EmptyZipArchive { path: PathBuf },
    #[error("archive at {path} has no CSV entry")]
    MissingCsvEntry { path: PathBuf },
    #[error("archive at {path} lacks a {column} column")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("no local archive at {path}; source the month first")]
    MissingArchive { path: PathBuf },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub fn archive_ref(city: City, year: i32, month: u32) -> TripArchiveRef {
    let file_stem = city.archive_file_stem(year, month);
    TripArchiveRef {
        city,
        year,
        month,
        url: format!("https://{}{file_stem}.zip", city.archive_url_head()),
        relative_path: PathBuf::from(format!("{}/{file_stem}.zip", city.as_str())),
        file_stem,
    }
}

/// Months of `req.year` to fetch; the current year stops at `today`'s month.
pub fn plan_trip_archives(
    req: &TripArchiveRequest,
    today: NaiveDate,
) -> Result<Vec<TripArchiveRef>, TripLoadError> {
    if !req.city.publishes_year(req.year) {
        return Err(TripLoadError::NotPublished {
            city: req.city,
            last_year: crate::city::PORTLAND_LAST_PUBLISHED_YEAR,
        });
    }
    if req.year > today.year() {
        return Err(TripLoadError::InvalidRequest(format!(
            "year {} is in the future",
            req.year
        )));
    }

    let last_month = if req.year == today.year() {
        today.month()
    } else {
        12
    };
    let months: Vec<u32> = match &req.months {
        Some(months) => {
            if let Some(bad) = months.iter().find(|m| !(1..=12).contains(*m)) {
                return Err(TripLoadError::InvalidRequest(format!(
                    "month {bad} is outside 1..=12"
                )));
            }
            let mut months = months.clone();
            months.sort_unstable();
            months.dedup();
            months
        }
        None => (1..=last_month).collect(),
    };

    Ok(months
        .into_iter()
        .map(|month| archive_ref(req.city, req.year, month))
        .collect())
}

pub fn sync_trip_archives(
    req: &TripArchiveRequest,
    cfg: &TripArchiveConfig,
) -> Result<Vec<LocalTripArchive>, TripLoadError> {
    let archives = plan_trip_archives(req, chrono::Utc::now().date_naive())?;
    info!(
        component = "trip_archives",
        event = "sourcing.sync.start",
        city = req.city.as_str(),
        city_name = req.city.display_name(),
        year = req.year,
        archive_count = archives.len()
    );

    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    sync_trip_archives_with_fetcher(&archives, cfg, &fetcher)
}

/// Probes the system-data page; a 200 means the city publishes trip data.
pub fn city_has_data(city: City, cfg: &TripArchiveConfig) -> Result<bool, TripLoadError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    city_has_data_with_fetcher(city, &fetcher)
}

fn city_has_data_with_fetcher(city: City, fetcher: &dyn HttpFetcher) -> Result<bool, TripLoadError> {
    let url = city.system_data_url();
    let status = fetcher.status(&url)?;
    let has_data = status == 200;
    if has_data {
        info!(
            component = "trip_archives",
            event = "sourcing.city.available",
            city = city.as_str(),
            city_name = city.display_name(),
            url = %url
        );
    } else {
        warn!(
            component = "trip_archives",
            event = "sourcing.city.unavailable",
            city = city.as_str(),
            city_name = city.display_name(),
            url = %url,
            status
        );
    }
    Ok(has_data)
}

fn sync_trip_archives_with_fetcher(
    archives: &[TripArchiveRef],
    cfg: &TripArchiveConfig,
    fetcher: &dyn HttpFetcher,
) -> Result<Vec<LocalTripArchive>, TripLoadError> {
    let mut local = Vec::with_capacity(archives.len());

    for archive in archives {
        let local_path = cfg.data_root.join(&archive.relative_path);
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if local_path.exists() {
            info!(
                component = "trip_archives",
                event = "sourcing.file.cached",
                city = archive.city.as_str(),
                path = %local_path.display()
            );
            local.push(LocalTripArchive {
                archive: archive.clone(),
                local_path,
                source: LocalArchiveSource::Cached,
            });
            continue;
        }

        let bytes = retry(cfg, || fetcher.get_bytes(&archive.url))?;
        write_atomic(&local_path, &bytes)?;

        info!(
            component = "trip_archives",
            event = "sourcing.file.downloaded",
            city = archive.city.as_str(),
            path = %local_path.display(),
            bytes = bytes.len()
        );
        debug!(
            component = "trip_archives",
            event = "sourcing.file.downloaded.debug",
            url = %archive.url
        );

        local.push(LocalTripArchive {
            archive: archive.clone(),
            local_path,
            source: LocalArchiveSource::Downloaded,
        });
    }

    Ok(local)
}

/// Parses the first CSV entry of a monthly archive into start and end events.
///
/// Timestamps in the file are local wall-clock time for `city`.
pub fn parse_trip_archive(path: &Path, city: City) -> Result<TripBatch, TripLoadError> {
    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;
    if zip.is_empty() {
        return Err(TripLoadError::EmptyZipArchive {
            path: path.to_path_buf(),
        });
    }

    let mut csv_buf = None;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() || entry.name().starts_with("__MACOSX") {
            continue;
        }
        if !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        csv_buf = Some(buf);
        break;
    }
    let csv_buf = csv_buf.ok_or_else(|| TripLoadError::MissingCsvEntry {
        path: path.to_path_buf(),
    })?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    parse_trip_csv(Cursor::new(csv_buf), city, &stem, path)
}

struct TripColumns {
    trip_id: Option<usize>,
    started_at: usize,
    ended_at: usize,
    start_station: usize,
    end_station: usize,
}

fn parse_trip_csv(
    reader: impl Read,
    city: City,
    stem: &str,
    path: &Path,
) -> Result<TripBatch, TripLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers: Vec<String> = reader.headers()?.iter().map(normalize_header).collect();
    let find = |aliases: &[&str]| headers.iter().position(|h| aliases.contains(&h.as_str()));
    let require = |aliases: &[&str], column: &'static str| {
        find(aliases).ok_or_else(|| TripLoadError::MissingColumn {
            path: path.to_path_buf(),
            column,
        })
    };
    let columns = TripColumns {
        trip_id: find(&TRIP_ID_COLUMNS[..]),
        started_at: require(&START_TIME_COLUMNS[..], "started_at")?,
        ended_at: require(&END_TIME_COLUMNS[..], "ended_at")?,
        start_station: require(&START_STATION_COLUMNS[..], "start_station_id")?,
        end_station: require(&END_STATION_COLUMNS[..], "end_station_id")?,
    };

    let mut batch = TripBatch::default();
    for (idx, record) in reader.records().enumerate() {
        let location = format!("{stem}:{}", idx + 2);
        batch.rows_read += 1;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                batch.reject(DataIntegrityError::MalformedRecord {
                    location,
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let trip_id = columns
            .trip_id
            .and_then(|col| field(&record, col))
            .map(str::to_string)
            .unwrap_or_else(|| location.clone());

        for (scenario, time_col, station_col) in [
            (Scenario::Start, columns.started_at, columns.start_station),
            (Scenario::End, columns.ended_at, columns.end_station),
        ] {
            match parse_event(&record, city, &trip_id, scenario, time_col, station_col) {
                Ok(event) => batch.events.push(event),
                Err(reason) => batch.reject(DataIntegrityError::MalformedRecord {
                    location: location.clone(),
                    reason,
                }),
            }
        }
    }

    info!(
        component = "trip_archives",
        event = "sourcing.archive.parsed",
        city = city.as_str(),
        archive = stem,
        rows_read = batch.rows_read,
        events = batch.events.len(),
        rejected_records = batch.rejected_records
    );

    Ok(batch)
}

fn parse_event(
    record: &StringRecord,
    city: City,
    trip_id: &str,
    scenario: Scenario,
    time_col: usize,
    station_col: usize,
) -> Result<RawTripEvent, String> {
    let station = field(record, station_col)
        .ok_or_else(|| format!("missing {scenario} station"))?;
    let raw_time = field(record, time_col).ok_or_else(|| format!("missing {scenario} time"))?;
    let ts_ms_utc = local_to_utc_ms(raw_time, city)
        .ok_or_else(|| format!("unparseable {scenario} time '{raw_time}'"))?;

    Ok(RawTripEvent {
        trip_id: trip_id.to_string(),
        entity_id: station.to_string(),
        event_type: scenario,
        ts_ms_utc,
        city,
    })
}

fn field(record: &StringRecord, idx: usize) -> Option<&str> {
    record
        .get(idx)
        .map(|raw| raw.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}

fn normalize_header(raw: &str) -> String {
    raw.trim()
        .trim_matches('"')
        .trim_start_matches('\u{feff}')
        .to_ascii_lowercase()
        .replace(' ', "_")
}

/// Ambiguous fall-back hours resolve to the earlier instant; spring-forward gaps are rejected.
fn local_to_utc_ms(raw: &str, city: City) -> Option<i64> {
    let naive = DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())?;
    city.timezone()
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Source of raw trip events for a city and an inclusive date range.
pub trait TripSource: Send + Sync {
    fn fetch_events(
        &self,
        city: City,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<TripBatch, TripLoadError>;
}

/// Reads archives already synced under `data_root`.
#[derive(Debug, Clone)]
pub struct LocalArchiveTripSource {
    data_root: PathBuf,
}

impl LocalArchiveTripSource {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }
}

impl TripSource for LocalArchiveTripSource {
    fn fetch_events(
        &self,
        city: City,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<TripBatch, TripLoadError> {
        if end_date < start_date {
            return Err(TripLoadError::InvalidRequest(
                "end_date must not be earlier than start_date".to_string(),
            ));
        }

        // Archives are split by local-time month; months just outside the local range are optional.
        let (local_start, local_end) = local_date_bounds(city, start_date, end_date)
            .ok_or_else(|| TripLoadError::InvalidRequest("date range overflows".to_string()))?;
        let required = months_covering(local_start, local_end);
        let padded = months_covering(
            local_start.pred_opt().unwrap_or(local_start),
            local_end.succ_opt().unwrap_or(local_end),
        );

        let mut batch = TripBatch::default();
        for (year, month) in padded {
            if !city.publishes_year(year) {
                continue;
            }
            let archive = archive_ref(city, year, month);
            let path = self.data_root.join(&archive.relative_path);
            if !path.exists() {
                if required.contains(&(year, month)) {
                    return Err(TripLoadError::MissingArchive { path });
                }
                debug!(
                    component = "trip_archives",
                    event = "sourcing.archive.edge_missing",
                    city = city.as_str(),
                    path = %path.display()
                );
                continue;
            }
            batch.absorb(parse_trip_archive(&path, city)?);
        }
        Ok(batch)
    }
}

/// Fixed event list; useful for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTripSource {
    events: Vec<RawTripEvent>,
}

impl InMemoryTripSource {
    pub fn new(events: Vec<RawTripEvent>) -> Self {
        Self { events }
    }
}

impl TripSource for InMemoryTripSource {
    fn fetch_events(
        &self,
        city: City,
        _start_date: NaiveDate,
        _end_date: NaiveDate,
    ) -> Result<TripBatch, TripLoadError> {
        let events: Vec<RawTripEvent> = self
            .events
            .iter()
            .filter(|e| e.city == city)
            .cloned()
            .collect();
        Ok(TripBatch {
            rows_read: events.len() as u64,
            events,
            ..TripBatch::default()
        })
    }
}

/// City-local dates spanned by the UTC instants `[start 00:00Z, end + 1 00:00Z)`.
fn local_date_bounds(
    city: City,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Option<(NaiveDate, NaiveDate)> {
    let tz = city.timezone();
    let first = start_date.and_hms_opt(0, 0, 0)?.and_utc();
    let last = end_date
        .checked_add_days(Days::new(1))?
        .and_hms_opt(0, 0, 0)?
        .and_utc()
        - TimeDelta::milliseconds(1);
    Some((
        first.with_timezone(&tz).date_naive(),
        last.with_timezone(&tz).date_naive(),
    ))
}

/// Calendar months overlapping the inclusive date range.
fn months_covering(start_date: NaiveDate, end_date: NaiveDate) -> Vec<(i32, u32)> {
    let mut out = Vec::new();
    let mut cursor = start_date.with_day(1);
    while let Some(month) = cursor {
        if month > end_date {
            break;
        }
        out.push((month.year(), month.month()));
        cursor = month.checked_add_months(Months::new(1));
    }
    out
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TripLoadError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            TripLoadError::InvalidRequest(format!("invalid output path: {}", path.display()))
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TripLoadError>;
    fn status(&self, url: &str) -> Result<u16, TripLoadError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, TripLoadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| TripLoadError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TripLoadError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| TripLoadError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TripLoadError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| TripLoadError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }

    fn status(&self, url: &str) -> Result<u16, TripLoadError> {
        self.client
            .get(url)
            .send()
            .map(|response| response.status().as_u16())
            .map_err(|err| TripLoadError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

fn retry<T>(
    cfg: &TripArchiveConfig,
    mut f: impl FnMut() -> Result<T, TripLoadError>,
) -> Result<T, TripLoadError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                debug!(
                    component = "trip_archives",
                    event = "sourcing.retry",
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
        statuses: HashMap<String, u16>,
        failures_before_success: Cell<u32>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.responses.insert(url.to_string(), body.to_vec());
            self
        }

        fn with_status(mut self, url: &str, status: u16) -> Self {
            self.statuses.insert(url.to_string(), status);
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TripLoadError> {
            if self.failures_before_success.get() > 0 {
                self.failures_before_success
                    .set(self.failures_before_success.get() - 1);
                return Err(TripLoadError::HttpRequest {
                    url: url.to_string(),
                    message: "transient".to_string(),
                });
            }
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| TripLoadError::HttpRequest {
                    url: url.to_string(),
                    message: "missing mock response".to_string(),
                })
        }

        fn status(&self, url: &str) -> Result<u16, TripLoadError> {
            Ok(self.statuses.get(url).copied().unwrap_or(404))
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn zip_bytes(csv_body: &str) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("202403-divvy-tripdata.csv", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(csv_body.as_bytes()).unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn current_year_plan_stops_at_current_month() {
        let req = TripArchiveRequest {
            city: City::Chicago,
            year: 2024,
            months: None,
        };
        let plan = plan_trip_archives(&req, date(2024, 4, 10)).unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(
            plan[0].url,
            "https://divvy-tripdata.s3.amazonaws.com/202401-divvy-tripdata.zip"
        );
        assert_eq!(plan[3].relative_path, PathBuf::from("chicago/202404-divvy-tripdata.zip"));

        let past = plan_trip_archives(
            &TripArchiveRequest {
                year: 2023,
                ..req.clone()
            },
            date(2024, 4, 10),
        )
        .unwrap();
        assert_eq!(past.len(), 12);
    }

    #[test]
    fn portland_after_2020_is_not_published() {
        let req = TripArchiveRequest {
            city: City::Portland,
            year: 2021,
            months: None,
        };
        assert!(matches!(
            plan_trip_archives(&req, date(2024, 1, 1)),
            Err(TripLoadError::NotPublished { .. })
        ));
    }

    #[test]
    fn explicit_months_are_validated_and_deduplicated() {
        let mut req = TripArchiveRequest {
            city: City::NewYork,
            year: 2023,
            months: Some(vec![3, 1, 3]),
        };
        let plan = plan_trip_archives(&req, date(2024, 1, 1)).unwrap();
        assert_eq!(
            plan.iter().map(|a| a.month).collect::<Vec<_>>(),
            vec![1, 3]
        );
        req.months = Some(vec![13]);
        assert!(matches!(
            plan_trip_archives(&req, date(2024, 1, 1)),
            Err(TripLoadError::InvalidRequest(_))
        ));
    }

    #[test]
    fn sync_downloads_with_retry_then_hits_cache() {
        let temp = tempdir().unwrap();
        let cfg = TripArchiveConfig {
            data_root: temp.path().to_path_buf(),
            retry_backoff_ms: 1,
            ..TripArchiveConfig::default()
        };
        let archive = archive_ref(City::Chicago, 2024, 3);
        let body = zip_bytes("ride_id,started_at,ended_at,start_station_id,end_station_id\n");
        let fetcher = MockFetcher::default().with(&archive.url, &body);
        fetcher.failures_before_success.set(1);

        let first = sync_trip_archives_with_fetcher(&[archive.clone()], &cfg, &fetcher).unwrap();
        assert_eq!(first[0].source, LocalArchiveSource::Downloaded);
        assert_eq!(fs::read(&first[0].local_path).unwrap(), body);

        let second =
            sync_trip_archives_with_fetcher(&[archive], &cfg, &MockFetcher::default()).unwrap();
        assert_eq!(second[0].source, LocalArchiveSource::Cached);
    }

    #[test]
    fn city_availability_follows_status_code() {
        let fetcher =
            MockFetcher::default().with_status("https://divvybikes.com/system-data", 200);
        assert!(city_has_data_with_fetcher(City::Chicago, &fetcher).unwrap());
        assert!(!city_has_data_with_fetcher(City::Columbus, &fetcher).unwrap());
    }

    #[test]
    fn legacy_headers_and_local_time_are_handled() {
        let csv = "\"Trip Id\",\"Start Time\",\"Stop Time\",\"From Station ID\",\"To Station ID\"\n\
                   t1,2019-07-04 08:15:00,2019-07-04 08:40:00,17,42\n";
        let batch =
            parse_trip_csv(Cursor::new(csv), City::Chicago, "201907", Path::new("x.zip")).unwrap();
        assert_eq!(batch.events.len(), 2);
        let start = &batch.events[0];
        assert_eq!(start.trip_id, "t1");
        assert_eq!(start.entity_id, "17");
        assert_eq!(start.event_type, Scenario::Start);
        // 08:15 CDT is 13:15 UTC.
        let expected = chrono::Utc
            .with_ymd_and_hms(2019, 7, 4, 13, 15, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(start.ts_ms_utc, expected);
    }

    #[test]
    fn rows_missing_a_station_keep_their_other_event() {
        let csv = "ride_id,started_at,ended_at,start_station_id,end_station_id\n\
                   r1,2024-03-01 10:00:00.123,2024-03-01 10:20:00,S1,\n\
                   r2,not-a-date,2024-03-01 11:00:00,S1,S2\n";
        let batch =
            parse_trip_csv(Cursor::new(csv), City::NewYork, "202403", Path::new("x.zip")).unwrap();
        assert_eq!(batch.rows_read, 2);
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.rejected_records, 2);
        assert!(matches!(
            batch.rejections[0],
            DataIntegrityError::MalformedRecord { .. }
        ));
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let csv = "ride_id,started_at,start_station_id\nr1,2024-03-01 10:00:00,S1\n";
        let err = parse_trip_csv(Cursor::new(csv), City::NewYork, "202403", Path::new("x.zip"))
            .unwrap_err();
        assert!(matches!(err, TripLoadError::MissingColumn { column: "ended_at", .. }));
    }

    #[test]
    fn local_bounds_reach_back_into_the_previous_local_day() {
        assert_eq!(
            local_date_bounds(City::Chicago, date(2024, 1, 1), date(2024, 1, 31)),
            Some((date(2023, 12, 31), date(2024, 1, 31)))
        );
        assert_eq!(
            local_date_bounds(City::BayArea, date(2024, 7, 2), date(2024, 7, 2)),
            Some((date(2024, 7, 1), date(2024, 7, 2)))
        );
    }

    #[test]
    fn months_covering_spans_year_boundaries() {
        assert_eq!(
            months_covering(date(2023, 12, 30), date(2024, 2, 1)),
            vec![(2023, 12), (2024, 1), (2024, 2)]
        );
        assert_eq!(
            months_covering(date(2024, 3, 10), date(2024, 3, 12)),
            vec![(2024, 3)]
        );
    }
}
