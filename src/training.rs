//! Comparable multi-family training runs over one scenario's feature window.
//!
//! Rules implemented:
//! - every family in a request sees the same chronological train/validation split
//! - validation hours are strictly later than every training hour
//! - a family that fails is recorded with a failure marker; siblings keep going
//! - the chosen hyperparameters are refit on the full window before the artifact is saved

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::FeatureRow;
use crate::models::{FittedModel, Hyperparameters, ModelError, ModelFamily, TrainingSet};
use crate::registry::{ModelArtifact, ModelRegistry};
use crate::store::{FeatureStore, HourRange, StoreError};
use crate::tuning::{plan_trials, select_best_trial, TrialOutcome, TrialPlan, TuningConfig};
use crate::Scenario;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Share of the most recent distinct hours held out for validation.
    pub validation_fraction: f64,
    pub min_training_rows: usize,
    pub seed: u64,
    /// Run families and trials on the calling thread.
    pub force_sequential: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            min_training_rows: 48,
            seed: 0,
            force_sequential: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRequest {
    pub scenario: Scenario,
    pub families: Vec<ModelFamily>,
    pub tuning: TuningConfig,
    pub window: HourRange,
    /// `None` trains on every entity stored for the scenario.
    pub entity_ids: Option<Vec<String>>,
    /// Replaces the family default as trial 0 (and as the only trial when untuned).
    pub hyperparameter_overrides: BTreeMap<ModelFamily, Hyperparameters>,
}

impl TrainingRequest {
    pub fn new(scenario: Scenario, families: Vec<ModelFamily>, window: HourRange) -> Self {
        Self {
            scenario,
            families,
            tuning: TuningConfig::default(),
            window,
            entity_ids: None,
            hyperparameter_overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationScore {
    pub mae: f64,
    pub rmse: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainingMetric {
    Scored(ValidationScore),
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub model_family: ModelFamily,
    pub scenario: Scenario,
    pub hyperparameters: Hyperparameters,
    pub metric: TrainingMetric,
    /// Index of the winning trial; `None` for untuned runs.
    pub tuning_trial_index: Option<u32>,
    pub trials_evaluated: u32,
    pub training_window: HourRange,
    pub artifact_id: Option<String>,
}

impl TrainingResult {
    pub fn is_failure(&self) -> bool {
        matches!(self.metric, TrainingMetric::Failed { .. })
    }

    pub fn score(&self) -> Option<ValidationScore> {
        match self.metric {
            TrainingMetric::Scored(score) => Some(score),
            TrainingMetric::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub train_rows: usize,
    pub validation_rows: usize,
    pub last_train_hour_ts_ms_utc: i64,
    pub first_validation_hour_ts_ms_utc: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub scenario: Scenario,
    pub split: SplitSummary,
    pub results: Vec<TrainingResult>,
}

impl TrainingReport {
    pub fn all_failed(&self) -> bool {
        self.results.iter().all(TrainingResult::is_failure)
    }

    pub fn result_for(&self, family: ModelFamily) -> Option<&TrainingResult> {
        self.results.iter().find(|r| r.model_family == family)
    }
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),
    #[error("insufficient data for {scenario}: {rows} labelled rows in window, at least {min_rows} required")]
    InsufficientData {
        scenario: Scenario,
        rows: usize,
        min_rows: usize,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Chronological split point: rows with `hour < cutoff` train, the rest validate.
pub fn chronological_cutoff(
    hours: impl IntoIterator<Item = i64>,
    validation_fraction: f64,
) -> Option<i64> {
    let hours: Vec<i64> = hours
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if hours.len() < 2 {
        return None;
    }
    let validation_hours = ((hours.len() as f64 * validation_fraction).ceil() as usize)
        .clamp(1, hours.len() - 1);
    Some(hours[hours.len() - validation_hours])
}

pub fn score_predictions(predicted: &[f64], actual: &[f64]) -> ValidationScore {
    let n = actual.len().max(1) as f64;
    let (abs, sq) = predicted
        .iter()
        .zip(actual)
        .fold((0.0, 0.0), |(abs, sq), (p, a)| {
            let err = p - a;
            (abs + err.abs(), sq + err * err)
        });
    ValidationScore {
        mae: abs / n,
        rmse: (sq / n).sqrt(),
    }
}

struct FamilyOutcome {
    family: ModelFamily,
    hyperparameters: Hyperparameters,
    tuning_trial_index: Option<u32>,
    trials_evaluated: u32,
    fitted: Result<(FittedModel, ValidationScore), String>,
}

pub struct TrainingOrchestrator {
    cfg: TrainingConfig,
}

impl TrainingOrchestrator {
    pub fn new(cfg: TrainingConfig) -> Result<Self, TrainingError> {
        if !(cfg.validation_fraction > 0.0 && cfg.validation_fraction < 1.0) {
            return Err(TrainingError::InvalidConfig(
                "validation_fraction must be in (0, 1)".to_string(),
            ));
        }
        if cfg.min_training_rows < 2 {
            return Err(TrainingError::InvalidConfig(
                "min_training_rows must be >= 2".to_string(),
            ));
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.cfg
    }

    pub fn train(
        &self,
        store: &FeatureStore,
        registry: &dyn ModelRegistry,
        req: &TrainingRequest,
    ) -> Result<TrainingReport, TrainingError> {
        let families = validate_request(req)?;

        let frame = store.read_features(req.entity_ids.as_deref(), req.scenario, req.window)?;
        let labelled: Vec<&FeatureRow> = frame.rows.iter().filter(|r| r.target.is_some()).collect();
        let insufficient = || TrainingError::InsufficientData {
            scenario: req.scenario,
            rows: labelled.len(),
            min_rows: self.cfg.min_training_rows,
        };
        let schema = match frame.schema.as_ref() {
            Some(schema) if labelled.len() >= self.cfg.min_training_rows => schema,
            _ => return Err(insufficient()),
        };

        let cutoff = chronological_cutoff(
            labelled.iter().map(|r| r.hour_ts_ms_utc),
            self.cfg.validation_fraction,
        )
        .ok_or_else(insufficient)?;
        let (train_rows, validation_rows): (Vec<&FeatureRow>, Vec<&FeatureRow>) = labelled
            .iter()
            .copied()
            .partition(|r| r.hour_ts_ms_utc < cutoff);

        let split = SplitSummary {
            train_rows: train_rows.len(),
            validation_rows: validation_rows.len(),
            last_train_hour_ts_ms_utc: train_rows
                .iter()
                .map(|r| r.hour_ts_ms_utc)
                .max()
                .unwrap_or(cutoff),
            first_validation_hour_ts_ms_utc: cutoff,
        };

        info!(
            component = "training",
            event = "training.split",
            scenario = req.scenario.as_str(),
            families = families.len(),
            tuning_enabled = req.tuning.enabled,
            trial_count = req.tuning.trial_count,
            train_rows = split.train_rows,
            validation_rows = split.validation_rows,
            cutoff_ts_ms_utc = cutoff
        );

        let run = |family: &ModelFamily| {
            self.run_family(*family, req, &train_rows, &validation_rows, &labelled)
        };
        let outcomes: Vec<FamilyOutcome> = if self.cfg.force_sequential {
            families.iter().map(run).collect()
        } else {
            families.par_iter().map(run).collect()
        };

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let saved = outcome.fitted.and_then(|(fitted, score)| {
                ModelArtifact::new(
                    req.scenario,
                    outcome.hyperparameters.clone(),
                    fitted,
                    req.window,
                    schema,
                    score,
                    outcome.tuning_trial_index,
                )
                .and_then(|artifact| registry.save(&artifact))
                .map(|artifact_id| (score, artifact_id))
                .map_err(|err| format!("saving artifact failed: {err}"))
            });

            let (metric, artifact_id) = match saved {
                Ok((score, artifact_id)) => {
                    info!(
                        component = "training",
                        event = "training.family.finish",
                        scenario = req.scenario.as_str(),
                        family = outcome.family.as_str(),
                        mae = score.mae,
                        rmse = score.rmse,
                        artifact_id = %artifact_id
                    );
                    (TrainingMetric::Scored(score), Some(artifact_id))
                }
                Err(reason) => {
                    warn!(
                        component = "training",
                        event = "training.family.failed",
                        scenario = req.scenario.as_str(),
                        family = outcome.family.as_str(),
                        reason = %reason
                    );
                    (TrainingMetric::Failed { reason }, None)
                }
            };

            let mut result = TrainingResult {
                model_family: outcome.family,
                scenario: req.scenario,
                hyperparameters: outcome.hyperparameters,
                metric,
                tuning_trial_index: outcome.tuning_trial_index,
                trials_evaluated: outcome.trials_evaluated,
                training_window: req.window,
                artifact_id,
            };
            if let Err(err) = registry.record_result(&result) {
                warn!(
                    component = "training",
                    event = "training.result.unrecorded",
                    scenario = req.scenario.as_str(),
                    family = result.model_family.as_str(),
                    error = %err
                );
                result.metric = TrainingMetric::Failed {
                    reason: format!("recording result failed: {err}"),
                };
            }
            results.push(result);
        }

        let report = TrainingReport {
            scenario: req.scenario,
            split,
            results,
        };

        info!(
            component = "training",
            event = "training.finish",
            scenario = req.scenario.as_str(),
            families = report.results.len(),
            failed = report.results.iter().filter(|r| r.is_failure()).count(),
            all_failed = report.all_failed()
        );

        Ok(report)
    }

    /// The orchestrator seed and the request's tuning seed both feed every trial seed;
    /// equal values never cancel out.
    fn trial_plans(
        &self,
        family: ModelFamily,
        tuning: &TuningConfig,
        base: &Hyperparameters,
    ) -> Vec<TrialPlan> {
        let tuning = TuningConfig {
            seed: combine_seeds(self.cfg.seed, tuning.seed),
            ..*tuning
        };
        plan_trials(family, &tuning, base)
    }

    fn run_family(
        &self,
        family: ModelFamily,
        req: &TrainingRequest,
        train_rows: &[&FeatureRow],
        validation_rows: &[&FeatureRow],
        all_rows: &[&FeatureRow],
    ) -> FamilyOutcome {
        let base = req
            .hyperparameter_overrides
            .get(&family)
            .cloned()
            .unwrap_or_else(|| Hyperparameters::default_for(family));
        let plans = self.trial_plans(family, &req.tuning, &base);
        let trials_evaluated = plans.len() as u32;

        let evaluate = |plan: &TrialPlan| TrialOutcome {
            plan: plan.clone(),
            score: fit_and_score(plan, train_rows, validation_rows).map_err(|e| e.to_string()),
        };
        let outcomes: Vec<TrialOutcome> = if self.cfg.force_sequential {
            plans.iter().map(evaluate).collect()
        } else {
            plans.par_iter().map(evaluate).collect()
        };

        let Some(best) = select_best_trial(&outcomes) else {
            let reason = outcomes
                .iter()
                .find_map(|o| o.score.as_ref().err().cloned())
                .unwrap_or_else(|| "no trial produced a finite validation score".to_string());
            return FamilyOutcome {
                family,
                hyperparameters: base,
                tuning_trial_index: None,
                trials_evaluated,
                fitted: Err(reason),
            };
        };

        let fitted = best.score.clone().and_then(|score| {
            let final_set = training_set(all_rows).map_err(|e| e.to_string())?;
            FittedModel::fit(&best.plan.hyperparameters, &final_set, best.plan.seed)
                .map(|model| (model, score))
                .map_err(|e| e.to_string())
        });

        FamilyOutcome {
            family,
            hyperparameters: best.plan.hyperparameters.clone(),
            tuning_trial_index: req.tuning.enabled.then_some(best.plan.trial_index),
            trials_evaluated,
            fitted,
        }
    }
}

fn combine_seeds(orchestrator_seed: u64, request_seed: u64) -> u64 {
    let mut z = orchestrator_seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    (z ^ (z >> 31)).wrapping_add(request_seed)
}

fn validate_request(req: &TrainingRequest) -> Result<Vec<ModelFamily>, TrainingError> {
    let families: Vec<ModelFamily> = req
        .families
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if families.is_empty() {
        return Err(TrainingError::InvalidConfig(
            "at least one model family is required".to_string(),
        ));
    }
    if req.tuning.enabled && req.tuning.trial_count == 0 {
        return Err(TrainingError::InvalidConfig(
            "trial_count must be > 0 when tuning is enabled".to_string(),
        ));
    }
    for (family, params) in &req.hyperparameter_overrides {
        if params.family() != *family {
            return Err(TrainingError::InvalidConfig(format!(
                "override for {family} carries {} hyperparameters",
                params.family()
            )));
        }
    }
    Ok(families)
}

fn training_set<'a>(rows: &[&'a FeatureRow]) -> Result<TrainingSet<'a>, ModelError> {
    let features = rows.iter().map(|r| r.values.as_slice()).collect();
    let targets = rows
        .iter()
        .map(|r| r.target.map(f64::from).unwrap_or(f64::NAN))
        .collect();
    TrainingSet::new(features, targets)
}

fn fit_and_score(
    plan: &TrialPlan,
    train_rows: &[&FeatureRow],
    validation_rows: &[&FeatureRow],
) -> Result<ValidationScore, ModelError> {
    let train = training_set(train_rows)?;
    let model = FittedModel::fit(&plan.hyperparameters, &train, plan.seed)?;

    let mut predicted = Vec::with_capacity(validation_rows.len());
    let mut actual = Vec::with_capacity(validation_rows.len());
    for row in validation_rows {
        predicted.push(model.predict_count(&row.values)?);
        actual.push(row.target.map(f64::from).unwrap_or(0.0));
    }

    let score = score_predictions(&predicted, &actual);
    if !score.mae.is_finite() || !score.rmse.is_finite() {
        return Err(ModelError::NonFinite("validation metric is not finite".to_string()));
    }
    Ok(score)
}
