//! Raw trip events to a gap-free hourly count series per station and scenario.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{Days, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{City, Scenario, ALL_SCENARIOS};

pub const HOUR_MS: i64 = 3_600_000;
const MAX_REPORTED_REJECTIONS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTripEvent {
    pub trip_id: String,
    pub entity_id: String,
    pub event_type: Scenario,
    pub ts_ms_utc: i64,
    pub city: City,
}

impl RawTripEvent {
    /// Builds an event from untyped fields, rejecting unknown event types.
    pub fn from_parts(
        trip_id: impl Into<String>,
        entity_id: impl Into<String>,
        event_type: &str,
        ts_ms_utc: i64,
        city: City,
    ) -> Result<Self, DataIntegrityError> {
        let trip_id = trip_id.into();
        let event_type = parse_event_type(&trip_id, event_type)?;
        Ok(Self {
            trip_id,
            entity_id: entity_id.into(),
            event_type,
            ts_ms_utc,
            city,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourlyObservation {
    pub entity_id: String,
    pub scenario: Scenario,
    pub hour_ts_ms_utc: i64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityPolicy {
    Strict,
    ReportAndSkip,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataIntegrityError {
    #[error("{event_type} event of trip {trip_id} at {ts_ms_utc} is outside the valid range for {city}")]
    OutOfRange {
        trip_id: String,
        event_type: Scenario,
        ts_ms_utc: i64,
        city: City,
    },
    #[error("unrecognized event type '{value}' for trip {trip_id}")]
    UnrecognizedEventType { trip_id: String, value: String },
    #[error("trip {trip_id} belongs to {actual}, expected {expected}")]
    CityMismatch {
        trip_id: String,
        expected: City,
        actual: City,
    },
    #[error("malformed record at {location}: {reason}")]
    MalformedRecord { location: String, reason: String },
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid normalize request: {0}")]
    InvalidRequest(String),
    #[error("data integrity error: {0}")]
    DataIntegrity(#[from] DataIntegrityError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeRequest {
    pub city: City,
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
    /// Entities seen in earlier batches; they get zero-filled rows even without events here.
    pub known_entities: BTreeSet<String>,
    pub policy: IntegrityPolicy,
}

impl NormalizeRequest {
    pub fn new(city: City, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            city,
            start_date,
            end_date,
            known_entities: BTreeSet::new(),
            policy: IntegrityPolicy::Strict,
        }
    }

    pub fn hour_bounds(&self) -> Result<(i64, i64), NormalizeError> {
        if self.end_date < self.start_date {
            return Err(NormalizeError::InvalidRequest(
                "end_date must not be earlier than start_date".to_string(),
            ));
        }
        let end_exclusive = self
            .end_date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| NormalizeError::InvalidRequest("end_date overflows".to_string()))?;
        Ok((date_start_ms(self.start_date)?, date_start_ms(end_exclusive)?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub input_events: u64,
    pub duplicate_events_removed: u64,
    pub events_outside_request: u64,
    pub rejected_events: u64,
    pub rejections: Vec<DataIntegrityError>,
    pub entities: u64,
    pub hours: u64,
    pub output_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSeries {
    /// Sorted by (entity_id, scenario, hour).
    pub observations: Vec<HourlyObservation>,
    pub report: NormalizeReport,
}

impl NormalizedSeries {
    /// Contiguous per-(entity, scenario) slices.
    pub fn series(&self) -> impl Iterator<Item = &[HourlyObservation]> {
        self.observations
            .chunk_by(|a, b| a.entity_id == b.entity_id && a.scenario == b.scenario)
    }

    pub fn series_for(&self, scenario: Scenario) -> impl Iterator<Item = &[HourlyObservation]> {
        self.series()
            .filter(move |slice| slice.first().map(|o| o.scenario) == Some(scenario))
    }
}

pub fn parse_event_type(trip_id: &str, raw: &str) -> Result<Scenario, DataIntegrityError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "start" => Ok(Scenario::Start),
        "end" => Ok(Scenario::End),
        _ => Err(DataIntegrityError::UnrecognizedEventType {
            trip_id: trip_id.to_string(),
            value: raw.to_string(),
        }),
    }
}

pub fn truncate_to_hour(ts_ms_utc: i64) -> i64 {
    ts_ms_utc.div_euclid(HOUR_MS) * HOUR_MS
}

/// Buckets events into hourly counts and emits the full
/// `entities x scenarios x hours` grid, zero-filling hours without events.
pub fn normalize_hourly(
    events: &[RawTripEvent],
    req: &NormalizeRequest,
) -> Result<NormalizedSeries, NormalizeError> {
    let (start_ms, end_ms_exclusive) = req.hour_bounds()?;
    let valid_range = req.city.valid_range();

    let mut report = NormalizeReport {
        input_events: events.len() as u64,
        ..NormalizeReport::default()
    };
    let mut entities: BTreeSet<&str> = req.known_entities.iter().map(String::as_str).collect();
    let mut seen: HashSet<(&str, Scenario)> = HashSet::with_capacity(events.len());
    let mut buckets: HashMap<(&str, Scenario, i64), u32> = HashMap::new();

    for event in events {
        if let Err(err) = validate_event(event, req.city, &valid_range) {
            match req.policy {
                IntegrityPolicy::Strict => return Err(err.into()),
                IntegrityPolicy::ReportAndSkip => {
                    debug!(
                        component = "normalize",
                        event = "normalize.event.rejected",
                        reason = %err
                    );
                    record_rejection(&mut report, err);
                    continue;
                }
            }
        }

        if !seen.insert((event.trip_id.as_str(), event.event_type)) {
            report.duplicate_events_removed += 1;
            continue;
        }

        entities.insert(event.entity_id.as_str());

        if event.ts_ms_utc < start_ms || event.ts_ms_utc >= end_ms_exclusive {
            report.events_outside_request += 1;
            continue;
        }

        *buckets
            .entry((
                event.entity_id.as_str(),
                event.event_type,
                truncate_to_hour(event.ts_ms_utc),
            ))
            .or_insert(0) += 1;
    }

    let hours = ((end_ms_exclusive - start_ms) / HOUR_MS) as usize;
    let mut observations = Vec::with_capacity(entities.len() * ALL_SCENARIOS.len() * hours);
    for entity_id in &entities {
        for scenario in ALL_SCENARIOS {
            for idx in 0..hours {
                let hour_ts_ms_utc = start_ms + idx as i64 * HOUR_MS;
                let count = buckets
                    .get(&(*entity_id, scenario, hour_ts_ms_utc))
                    .copied()
                    .unwrap_or(0);
                observations.push(HourlyObservation {
                    entity_id: (*entity_id).to_string(),
                    scenario,
                    hour_ts_ms_utc,
                    count,
                });
            }
        }
    }

    report.entities = entities.len() as u64;
    report.hours = hours as u64;
    report.output_rows = observations.len() as u64;

    if report.rejected_events > 0 {
        warn!(
            component = "normalize",
            event = "normalize.rejections",
            city = req.city.as_str(),
            rejected_events = report.rejected_events
        );
    }

    info!(
        component = "normalize",
        event = "normalize.finish",
        city = req.city.as_str(),
        start_date = %req.start_date,
        end_date = %req.end_date,
        input_events = report.input_events,
        duplicate_events_removed = report.duplicate_events_removed,
        rejected_events = report.rejected_events,
        entities = report.entities,
        hours = report.hours,
        output_rows = report.output_rows
    );

    Ok(NormalizedSeries {
        observations,
        report,
    })
}

fn validate_event(
    event: &RawTripEvent,
    city: City,
    valid_range: &crate::ValidRange,
) -> Result<(), DataIntegrityError> {
    if event.city != city {
        return Err(DataIntegrityError::CityMismatch {
            trip_id: event.trip_id.clone(),
            expected: city,
            actual: event.city,
        });
    }
    if event.entity_id.trim().is_empty() {
        return Err(DataIntegrityError::MalformedRecord {
            location: format!("trip {}", event.trip_id),
            reason: format!("empty entity id on {} event", event.event_type),
        });
    }
    if !valid_range.contains(event.ts_ms_utc) {
        return Err(DataIntegrityError::OutOfRange {
            trip_id: event.trip_id.clone(),
            event_type: event.event_type,
            ts_ms_utc: event.ts_ms_utc,
            city,
        });
    }
    Ok(())
}

fn record_rejection(report: &mut NormalizeReport, err: DataIntegrityError) {
    report.rejected_events += 1;
    if report.rejections.len() < MAX_REPORTED_REJECTIONS {
        report.rejections.push(err);
    }
}

pub(crate) fn date_start_ms(date: NaiveDate) -> Result<i64, NormalizeError> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| NormalizeError::InvalidRequest(format!("invalid date {date}")))?;
    Ok(Utc.from_utc_datetime(&midnight).timestamp_millis())
}
