//! Drives feature and prediction backfills for a city over an inclusive date range.
//!
//! Rules implemented:
//! - scenarios are independent; one failing scenario never blocks another
//! - feature backfill recomputes and upserts, so rerunning a range is safe
//! - prediction backfill needs a trained model and stored feature rows for the range

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{
    assert_schema_compatible, FeatureConfig, FeatureError, FeatureRow, FeatureWindowBuilder,
};
use crate::models::{ModelError, ModelFamily};
use crate::normalize::{
    normalize_hourly, HourlyObservation, IntegrityPolicy, NormalizeError, NormalizeRequest,
    HOUR_MS,
};
use crate::registry::{ModelRegistry, RegistryError};
use crate::store::{FeatureStore, HourRange, Partition, PredictionRow, StoreError};
use crate::trip_archives::{TripLoadError, TripSource};
use crate::{City, Scenario, ALL_SCENARIOS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillTarget {
    Features,
    Predictions,
}

impl BackfillTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Features => "features",
            Self::Predictions => "predictions",
        }
    }
}

impl fmt::Display for BackfillTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillTarget {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "features" | "feature" => Ok(Self::Features),
            "predictions" | "prediction" => Ok(Self::Predictions),
            _ => Err(BackfillError::InvalidRequest(format!(
                "unknown backfill target '{s}' (expected 'features' or 'predictions')"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillConfig {
    pub city: City,
    pub feature: FeatureConfig,
    pub integrity_policy: IntegrityPolicy,
    /// Family used for predictions; `None` picks the best scoring latest artifact.
    pub model_family: Option<ModelFamily>,
    pub force_sequential: bool,
}

impl BackfillConfig {
    pub fn new(city: City) -> Self {
        Self {
            city,
            feature: FeatureConfig::default(),
            integrity_policy: IntegrityPolicy::ReportAndSkip,
            model_family: None,
            force_sequential: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub scenarios: Vec<Scenario>,
    pub target: BackfillTarget,
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub rows_written: u64,
    pub entities: u64,
    pub hours: u64,
    /// Entities skipped because they had no eligible hour at all.
    pub entities_without_history: u64,
    /// Keys in the range with no stored feature row (predictions only).
    pub missing_feature_rows: u64,
    pub artifact_id: Option<String>,
}

#[derive(Debug)]
pub struct ScenarioBackfill {
    pub scenario: Scenario,
    pub outcome: Result<BackfillSummary, BackfillError>,
}

#[derive(Debug)]
pub struct BackfillReport {
    pub city: City,
    pub target: BackfillTarget,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub source_rejected_records: u64,
    pub normalize_rejected_events: u64,
    pub scenarios: Vec<ScenarioBackfill>,
}

impl BackfillReport {
    pub fn has_failures(&self) -> bool {
        self.scenarios.iter().any(|s| s.outcome.is_err())
    }

    pub fn outcome_for(&self, scenario: Scenario) -> Option<&Result<BackfillSummary, BackfillError>> {
        self.scenarios
            .iter()
            .find(|s| s.scenario == scenario)
            .map(|s| &s.outcome)
    }
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("invalid backfill request: {0}")]
    InvalidRequest(String),
    #[error("no trained {requested} model found for scenario {scenario}")]
    ModelNotFound { scenario: Scenario, requested: String },
    #[error("no feature rows stored for scenario {scenario} in [{start_ts_ms_utc}, {end_ts_ms_utc_exclusive}); backfill features first")]
    MissingFeatures {
        scenario: Scenario,
        start_ts_ms_utc: i64,
        end_ts_ms_utc_exclusive: i64,
    },
    #[error("normalize error: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("feature error: {0}")]
    Feature(#[from] FeatureError),
    #[error("trip source error: {0}")]
    Source(#[from] TripLoadError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

pub struct BackfillCoordinator {
    cfg: BackfillConfig,
    builder: FeatureWindowBuilder,
}

impl BackfillCoordinator {
    pub fn new(cfg: BackfillConfig) -> Result<Self, BackfillError> {
        let builder = FeatureWindowBuilder::new(cfg.feature.clone(), cfg.city)?;
        Ok(Self { cfg, builder })
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.cfg
    }

    pub fn run(
        &self,
        req: &BackfillRequest,
        source: &dyn TripSource,
        store: &mut FeatureStore,
        registry: &dyn ModelRegistry,
    ) -> Result<BackfillReport, BackfillError> {
        match req.target {
            BackfillTarget::Features => self.backfill_features(
                source,
                store,
                &req.scenarios,
                req.start_date,
                req.end_date,
            ),
            BackfillTarget::Predictions => self.backfill_predictions(
                store,
                registry,
                &req.scenarios,
                req.start_date,
                req.end_date,
            ),
        }
    }

    /// Normalizes events from `source`, builds feature rows and upserts those inside the range.
    ///
    /// Normalization starts early enough that the first hour of the range has full history.
    pub fn backfill_features(
        &self,
        source: &dyn TripSource,
        store: &mut FeatureStore,
        scenarios: &[Scenario],
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<BackfillReport, BackfillError> {
        let scenarios = validate_scenarios(scenarios)?;
        let window = output_window(self.cfg.city, start_date, end_date)?;
        let history_days = (self.cfg.feature.required_history_hours() as u64).div_ceil(24);
        let extended_start = start_date
            .checked_sub_days(Days::new(history_days))
            .ok_or_else(|| BackfillError::InvalidRequest("start_date underflows".to_string()))?;

        info!(
            component = "backfill",
            event = "backfill.features.start",
            city = self.cfg.city.as_str(),
            start_date = %start_date,
            end_date = %end_date,
            extended_start = %extended_start,
            scenarios = scenarios.len()
        );

        let batch = source.fetch_events(self.cfg.city, extended_start, end_date)?;
        if batch.rejected_records > 0 {
            warn!(
                component = "backfill",
                event = "backfill.source.rejections",
                city = self.cfg.city.as_str(),
                rejected_records = batch.rejected_records
            );
        }

        let mut known_entities = BTreeSet::new();
        for scenario in ALL_SCENARIOS {
            known_entities.extend(store.entity_ids(Partition::Features, scenario)?);
        }
        let normalize_req = NormalizeRequest {
            city: self.cfg.city,
            start_date: extended_start,
            end_date,
            known_entities,
            policy: self.cfg.integrity_policy,
        };
        let normalized = normalize_hourly(&batch.events, &normalize_req)?;

        let mut outcomes = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let series: Vec<&[HourlyObservation]> = normalized.series_for(scenario).collect();
            let outcome = self
                .build_scenario_rows(&series, window)
                .and_then(|(rows, mut summary)| {
                    summary.rows_written = store.upsert_features(&rows, self.builder.schema())?;
                    summary.hours = window.hours();
                    Ok(summary)
                });
            log_scenario_outcome(BackfillTarget::Features, scenario, &outcome);
            outcomes.push(ScenarioBackfill { scenario, outcome });
        }

        Ok(BackfillReport {
            city: self.cfg.city,
            target: BackfillTarget::Features,
            start_date,
            end_date,
            source_rejected_records: batch.rejected_records,
            normalize_rejected_events: normalized.report.rejected_events,
            scenarios: outcomes,
        })
    }

    /// Applies the scenario's model to stored feature rows and upserts the predictions.
    pub fn backfill_predictions(
        &self,
        store: &mut FeatureStore,
        registry: &dyn ModelRegistry,
        scenarios: &[Scenario],
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<BackfillReport, BackfillError> {
        let scenarios = validate_scenarios(scenarios)?;
        let window = output_window(self.cfg.city, start_date, end_date)?;

        info!(
            component = "backfill",
            event = "backfill.predictions.start",
            city = self.cfg.city.as_str(),
            start_date = %start_date,
            end_date = %end_date,
            scenarios = scenarios.len(),
            model_family = self.cfg.model_family.map(ModelFamily::as_str).unwrap_or("best")
        );

        let mut outcomes = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let outcome = self.predict_scenario(store, registry, scenario, window);
            log_scenario_outcome(BackfillTarget::Predictions, scenario, &outcome);
            outcomes.push(ScenarioBackfill { scenario, outcome });
        }

        Ok(BackfillReport {
            city: self.cfg.city,
            target: BackfillTarget::Predictions,
            start_date,
            end_date,
            source_rejected_records: 0,
            normalize_rejected_events: 0,
            scenarios: outcomes,
        })
    }

    fn build_scenario_rows(
        &self,
        series: &[&[HourlyObservation]],
        window: HourRange,
    ) -> Result<(Vec<FeatureRow>, BackfillSummary), BackfillError> {
        let build = |slice: &&[HourlyObservation]| self.builder.build(slice);
        let built: Vec<Result<_, FeatureError>> = if self.cfg.force_sequential {
            series.iter().map(build).collect()
        } else {
            series.par_iter().map(build).collect()
        };

        let mut summary = BackfillSummary {
            entities: series.len() as u64,
            ..BackfillSummary::default()
        };
        let mut rows = Vec::new();
        let mut first_history_error = None;
        for result in built {
            match result {
                Ok((entity_rows, _)) => rows.extend(
                    entity_rows
                        .into_iter()
                        .filter(|row| window.contains(row.hour_ts_ms_utc)),
                ),
                Err(err @ FeatureError::InsufficientHistory { .. }) => {
                    summary.entities_without_history += 1;
                    first_history_error.get_or_insert(err);
                }
                Err(err) => return Err(err.into()),
            }
        }

        if rows.is_empty() {
            if let Some(err) = first_history_error {
                return Err(err.into());
            }
        }

        Ok((rows, summary))
    }

    fn predict_scenario(
        &self,
        store: &mut FeatureStore,
        registry: &dyn ModelRegistry,
        scenario: Scenario,
        window: HourRange,
    ) -> Result<BackfillSummary, BackfillError> {
        let artifact = match self.cfg.model_family {
            Some(family) => registry.load(scenario, family)?,
            None => registry.load_best(scenario)?,
        }
        .ok_or_else(|| BackfillError::ModelNotFound {
            scenario,
            requested: self
                .cfg
                .model_family
                .map(|f| f.as_str().to_string())
                .unwrap_or_else(|| "(any family)".to_string()),
        })?;

        let frame = store.read_features(None, scenario, window)?;
        let schema = match (&frame.schema, frame.rows.is_empty()) {
            (Some(schema), false) => schema,
            _ => {
                return Err(BackfillError::MissingFeatures {
                    scenario,
                    start_ts_ms_utc: window.start_ts_ms_utc,
                    end_ts_ms_utc_exclusive: window.end_ts_ms_utc_exclusive,
                })
            }
        };
        assert_schema_compatible(artifact.schema_version, &artifact.schema_fingerprint, schema)?;

        let predict = |row: &FeatureRow| -> Result<PredictionRow, ModelError> {
            Ok(PredictionRow {
                entity_id: row.entity_id.clone(),
                scenario,
                hour_ts_ms_utc: row.hour_ts_ms_utc,
                predicted_count: artifact.fitted.predict_count(&row.values)?,
                artifact_id: artifact.artifact_id.clone(),
            })
        };
        let predictions: Vec<PredictionRow> = if self.cfg.force_sequential {
            frame.rows.iter().map(predict).collect::<Result<_, _>>()?
        } else {
            frame.rows.par_iter().map(predict).collect::<Result<_, _>>()?
        };

        let entities: BTreeSet<&str> = frame.rows.iter().map(|r| r.entity_id.as_str()).collect();
        let expected = entities.len() as u64 * window.hours();
        let rows_written = store.upsert_predictions(&predictions)?;

        Ok(BackfillSummary {
            rows_written,
            entities: entities.len() as u64,
            hours: window.hours(),
            entities_without_history: 0,
            missing_feature_rows: expected.saturating_sub(frame.rows.len() as u64),
            artifact_id: Some(artifact.artifact_id.clone()),
        })
    }
}

fn validate_scenarios(scenarios: &[Scenario]) -> Result<Vec<Scenario>, BackfillError> {
    let unique: Vec<Scenario> = scenarios
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if unique.is_empty() {
        return Err(BackfillError::InvalidRequest(
            "at least one scenario is required".to_string(),
        ));
    }
    Ok(unique)
}

fn output_window(
    city: City,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<HourRange, BackfillError> {
    let (start, end) = NormalizeRequest::new(city, start_date, end_date).hour_bounds()?;
    debug_assert_eq!(start % HOUR_MS, 0);
    Ok(HourRange::new(start, end)?)
}

fn log_scenario_outcome(
    target: BackfillTarget,
    scenario: Scenario,
    outcome: &Result<BackfillSummary, BackfillError>,
) {
    match outcome {
        Ok(summary) => info!(
            component = "backfill",
            event = "backfill.scenario.finish",
            target = target.as_str(),
            scenario = scenario.as_str(),
            rows_written = summary.rows_written,
            entities = summary.entities,
            hours = summary.hours,
            entities_without_history = summary.entities_without_history,
            missing_feature_rows = summary.missing_feature_rows
        ),
        Err(err) => warn!(
            component = "backfill",
            event = "backfill.scenario.failed",
            target = target.as_str(),
            scenario = scenario.as_str(),
            error = %err
        ),
    }
}
