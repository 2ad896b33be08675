//! Seeded random search over each model family's hyperparameter space.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::models::{
    hyperparameter_space, Hyperparameters, ModelFamily, ParamRange, ParamSample, ParamScale,
};
use crate::training::ValidationScore;

pub const DEFAULT_TRIAL_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningConfig {
    pub enabled: bool,
    pub trial_count: u32,
    pub seed: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trial_count: DEFAULT_TRIAL_COUNT,
            seed: 0,
        }
    }
}

impl TuningConfig {
    pub fn enabled(trial_count: u32, seed: u64) -> Self {
        Self {
            enabled: true,
            trial_count,
            seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialPlan {
    pub trial_index: u32,
    pub hyperparameters: Hyperparameters,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome {
    pub plan: TrialPlan,
    pub score: Result<ValidationScore, String>,
}

/// Trial 0 is always `base`; later trials are sampled from the family's space.
/// Untuned runs get exactly one plan.
pub fn plan_trials(
    family: ModelFamily,
    cfg: &TuningConfig,
    base: &Hyperparameters,
) -> Vec<TrialPlan> {
    let trial_count = if cfg.enabled { cfg.trial_count.max(1) } else { 1 };
    let space = hyperparameter_space(family);

    (0..trial_count)
        .map(|trial_index| {
            let seed = trial_seed(cfg.seed, family, trial_index);
            let hyperparameters = if trial_index == 0 {
                base.clone()
            } else {
                let mut rng = StdRng::seed_from_u64(seed);
                Hyperparameters::from_sample(family, &sample_params(&space, &mut rng))
            };
            TrialPlan {
                trial_index,
                hyperparameters,
                seed,
            }
        })
        .collect()
}

pub fn sample_params(space: &[ParamRange], rng: &mut StdRng) -> ParamSample {
    space
        .iter()
        .map(|range| {
            let raw = match range.scale {
                ParamScale::Linear => rng.random_range(range.low..=range.high),
                ParamScale::Log => rng.random_range(range.low.ln()..=range.high.ln()).exp(),
            };
            let value = if range.integer { raw.round() } else { raw };
            (range.name.to_string(), value.clamp(range.low, range.high))
        })
        .collect()
}

/// Lowest validation MAE wins; ties go to the earliest trial.
pub fn select_best_trial(outcomes: &[TrialOutcome]) -> Option<&TrialOutcome> {
    outcomes
        .iter()
        .filter_map(|outcome| outcome.score.as_ref().ok().map(|score| (outcome, score.mae)))
        .filter(|(_, mae)| mae.is_finite())
        .min_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then(a.0.plan.trial_index.cmp(&b.0.plan.trial_index))
        })
        .map(|(outcome, _)| outcome)
}

fn trial_seed(seed: u64, family: ModelFamily, trial_index: u32) -> u64 {
    let family_salt = match family {
        ModelFamily::Lasso => 0x4c41_5353_4f00_0001,
        ModelFamily::LightGbm => 0x4c47_424d_0000_0002,
        ModelFamily::XgBoost => 0x5847_4200_0000_0003,
    };
    seed.wrapping_mul(0x9e37_79b9_7f4a_7c15)
        ^ family_salt
        ^ (trial_index as u64).wrapping_mul(0xbf58_476d_1ce4_e5b9)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(trial_index: u32, mae: Option<f64>) -> TrialOutcome {
        TrialOutcome {
            plan: TrialPlan {
                trial_index,
                hyperparameters: Hyperparameters::default_for(ModelFamily::Lasso),
                seed: 0,
            },
            score: mae
                .map(|mae| ValidationScore { mae, rmse: mae })
                .ok_or_else(|| "fit failed".to_string()),
        }
    }

    #[test]
    fn untuned_runs_use_base_parameters_only() {
        let base = Hyperparameters::default_for(ModelFamily::XgBoost);
        let plans = plan_trials(ModelFamily::XgBoost, &TuningConfig::default(), &base);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].hyperparameters, base);
    }

    #[test]
    fn tuned_plans_are_deterministic_for_a_seed() {
        let base = Hyperparameters::default_for(ModelFamily::LightGbm);
        let cfg = TuningConfig::enabled(5, 11);
        let a = plan_trials(ModelFamily::LightGbm, &cfg, &base);
        let b = plan_trials(ModelFamily::LightGbm, &cfg, &base);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert_ne!(a[1].hyperparameters, a[2].hyperparameters);
    }

    #[test]
    fn samples_stay_inside_their_ranges() {
        let space = hyperparameter_space(ModelFamily::XgBoost);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let sample = sample_params(&space, &mut rng);
            for range in &space {
                let value = sample[range.name];
                assert!(value >= range.low && value <= range.high, "{} = {value}", range.name);
                if range.integer {
                    assert_eq!(value, value.round());
                }
            }
        }
    }

    #[test]
    fn best_trial_prefers_lowest_mae_then_earliest_index() {
        let outcomes = vec![
            outcome(0, Some(2.0)),
            outcome(1, None),
            outcome(2, Some(1.5)),
            outcome(3, Some(1.5)),
        ];
        assert_eq!(select_best_trial(&outcomes).unwrap().plan.trial_index, 2);
        assert!(select_best_trial(&[outcome(0, None)]).is_none());
    }
}
