//! Hourly series to lagged, rolling and calendar feature rows.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::calendar::{calendar_features, CALENDAR_FEATURE_NAMES};
use crate::normalize::HOUR_MS;
use crate::{City, HourlyObservation, Scenario};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub entity_id: String,
    pub scenario: Scenario,
    pub hour_ts_ms_utc: i64,
    pub values: Vec<f64>,
    /// Observed count for the hour; `None` for forecast-only rows.
    pub target: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub lag_hours: Vec<u32>,
    pub rolling_windows_hours: Vec<u32>,
    pub include_calendar: bool,
    /// Hours past the end of the series to emit target-less rows for.
    pub forecast_hours: u32,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lag_hours: vec![1, 2, 3, 24, 168],
            rolling_windows_hours: vec![3, 24, 168],
            include_calendar: true,
            forecast_hours: 0,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureConfig {
    /// Number of prior hours a row needs before it becomes eligible.
    pub fn required_history_hours(&self) -> u32 {
        self.lag_hours
            .iter()
            .chain(self.rolling_windows_hours.iter())
            .copied()
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBuildReport {
    pub input_hours: u64,
    pub output_rows: u64,
    pub forecast_rows: u64,
    pub excluded_hours: u64,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("invalid hourly series: {0}")]
    InvalidSeries(String),
    #[error(
        "insufficient history for {entity_id}/{scenario}: {input_hours} hours available, {required_history_hours} required before the first row"
    )]
    InsufficientHistory {
        entity_id: String,
        scenario: Scenario,
        input_hours: u64,
        required_history_hours: u32,
    },
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> FeatureSchema {
    let mut columns = Vec::new();

    for lag in &cfg.lag_hours {
        columns.push(FeatureColumn {
            name: format!("lag_{lag}h"),
            dtype: FeatureDType::F64,
        });
    }
    for window in &cfg.rolling_windows_hours {
        columns.push(FeatureColumn {
            name: format!("rolling_mean_{window}h"),
            dtype: FeatureDType::F64,
        });
    }
    if cfg.include_calendar {
        for name in CALENDAR_FEATURE_NAMES {
            columns.push(FeatureColumn {
                name: name.to_string(),
                dtype: FeatureDType::F64,
            });
        }
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    debug!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        lags = ?cfg.lag_hours,
        windows = ?cfg.rolling_windows_hours,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct FeatureWindowBuilder {
    cfg: FeatureConfig,
    city: City,
    schema: FeatureSchema,
}

impl FeatureWindowBuilder {
    pub fn new(cfg: FeatureConfig, city: City) -> Result<Self, FeatureError> {
        validate_config(&cfg)?;
        let schema = build_feature_schema(&cfg);
        Ok(Self { cfg, city, schema })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Emits one row per hour whose lag and rolling inputs all fall inside `series`.
    ///
    /// Hours without enough history are excluded, never zero-filled. Fails only when
    /// no hour at all is eligible.
    pub fn build(
        &self,
        series: &[HourlyObservation],
    ) -> Result<(Vec<FeatureRow>, FeatureBuildReport), FeatureError> {
        let (entity_id, scenario, first_hour) = validate_series(series)?;
        let counts: Vec<f64> = series.iter().map(|o| o.count as f64).collect();
        let last_idx = counts.len() as i64 - 1;

        let mut prefix = Vec::with_capacity(counts.len() + 1);
        prefix.push(0.0);
        for count in &counts {
            let running = prefix.last().copied().unwrap_or(0.0);
            prefix.push(running + count);
        }

        let mut report = FeatureBuildReport {
            input_hours: counts.len() as u64,
            ..FeatureBuildReport::default()
        };
        let mut rows = Vec::new();

        for idx in 0..=(last_idx + self.cfg.forecast_hours as i64) {
            if !self.is_eligible(idx, last_idx) {
                if idx <= last_idx {
                    report.excluded_hours += 1;
                }
                continue;
            }

            let hour_ts_ms_utc = first_hour + idx * HOUR_MS;
            let mut values = Vec::with_capacity(self.schema.columns.len());
            for lag in &self.cfg.lag_hours {
                values.push(counts[(idx - *lag as i64) as usize]);
            }
            for window in &self.cfg.rolling_windows_hours {
                let end = idx as usize;
                let start = end - *window as usize;
                values.push((prefix[end] - prefix[start]) / *window as f64);
            }
            if self.cfg.include_calendar {
                let calendar = calendar_features(hour_ts_ms_utc, self.city)
                    .ok_or(FeatureError::InvalidTimestamp(hour_ts_ms_utc))?;
                values.extend_from_slice(&calendar);
            }

            let target = if idx <= last_idx {
                Some(series[idx as usize].count)
            } else {
                report.forecast_rows += 1;
                None
            };

            rows.push(FeatureRow {
                entity_id: entity_id.to_string(),
                scenario,
                hour_ts_ms_utc,
                values,
                target,
            });
        }

        report.output_rows = rows.len() as u64;
        if rows.is_empty() {
            return Err(FeatureError::InsufficientHistory {
                entity_id: entity_id.to_string(),
                scenario,
                input_hours: report.input_hours,
                required_history_hours: self.cfg.required_history_hours(),
            });
        }

        debug!(
            component = "features",
            event = "features.build.finish",
            entity_id = entity_id,
            scenario = scenario.as_str(),
            input_hours = report.input_hours,
            output_rows = report.output_rows,
            excluded_hours = report.excluded_hours,
            forecast_rows = report.forecast_rows
        );

        Ok((rows, report))
    }

    /// Lag `h` reads index `idx - h`; a rolling window `w` reads `[idx - w, idx)`.
    fn is_eligible(&self, idx: i64, last_idx: i64) -> bool {
        let lags_ok = self.cfg.lag_hours.iter().all(|lag| {
            let source = idx - *lag as i64;
            source >= 0 && source <= last_idx
        });
        let windows_ok = self
            .cfg
            .rolling_windows_hours
            .iter()
            .all(|window| idx - (*window as i64) >= 0 && idx - 1 <= last_idx);
        lags_ok && windows_ok
    }
}

fn validate_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }

    if cfg.lag_hours.is_empty() && cfg.rolling_windows_hours.is_empty() && !cfg.include_calendar {
        return Err(FeatureError::InvalidConfig(
            "at least one feature family must be enabled".to_string(),
        ));
    }

    check_unique_positive("lag_hours", &cfg.lag_hours)?;
    check_unique_positive("rolling_windows_hours", &cfg.rolling_windows_hours)?;

    // Without a lag the first forecast hour would read its own (unobserved) count.
    if cfg.forecast_hours > 0 && !cfg.lag_hours.is_empty() {
        let min_lag = cfg.lag_hours.iter().copied().min().unwrap_or(1);
        if cfg.forecast_hours > min_lag {
            return Err(FeatureError::InvalidConfig(format!(
                "forecast_hours ({}) cannot exceed the smallest lag ({min_lag})",
                cfg.forecast_hours
            )));
        }
    }

    info!(
        component = "features",
        event = "features.config.validated",
        required_history_hours = cfg.required_history_hours(),
        include_calendar = cfg.include_calendar,
        forecast_hours = cfg.forecast_hours
    );

    Ok(())
}

fn check_unique_positive(field: &str, values: &[u32]) -> Result<(), FeatureError> {
    let mut seen = HashSet::new();
    for value in values {
        if *value == 0 {
            return Err(FeatureError::InvalidConfig(format!(
                "{field} entries must be > 0"
            )));
        }
        if !seen.insert(*value) {
            return Err(FeatureError::InvalidConfig(format!(
                "{field} entries must be unique"
            )));
        }
    }
    Ok(())
}

fn validate_series(series: &[HourlyObservation]) -> Result<(&str, Scenario, i64), FeatureError> {
    let first = series
        .first()
        .ok_or_else(|| FeatureError::InvalidSeries("series is empty".to_string()))?;
    if first.hour_ts_ms_utc % HOUR_MS != 0 {
        return Err(FeatureError::InvalidSeries(format!(
            "hour {} is not aligned to an hour boundary",
            first.hour_ts_ms_utc
        )));
    }

    for (idx, observation) in series.iter().enumerate() {
        if observation.entity_id != first.entity_id || observation.scenario != first.scenario {
            return Err(FeatureError::InvalidSeries(format!(
                "series mixes keys: {}/{} and {}/{}",
                first.entity_id, first.scenario, observation.entity_id, observation.scenario
            )));
        }
        let expected = first.hour_ts_ms_utc + idx as i64 * HOUR_MS;
        if observation.hour_ts_ms_utc != expected {
            return Err(FeatureError::InvalidSeries(format!(
                "gap in series for {}: expected hour {expected}, found {}",
                first.entity_id, observation.hour_ts_ms_utc
            )));
        }
    }

    Ok((first.entity_id.as_str(), first.scenario, first.hour_ts_ms_utc))
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update("lags:");
    for lag in &cfg.lag_hours {
        hasher.update(format!("{lag},"));
    }
    hasher.update(";windows:");
    for window in &cfg.rolling_windows_hours {
        hasher.update(format!("{window},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
