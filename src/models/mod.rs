//! Closed set of regression model families used to forecast hourly counts.
//!
//! Every family implements [`Regressor`]; callers pick a family by [`ModelFamily`] tag and
//! work with the tagged [`Hyperparameters`] and [`FittedModel`] enums.

mod boosting;
mod lasso;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use boosting::{
    BoostedTrees, LightGbmModel, LightGbmParams, RegressionNode, XgBoostModel, XgBoostParams,
};
pub use lasso::{LassoModel, LassoParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Lasso,
    LightGbm,
    XgBoost,
}

pub const ALL_MODEL_FAMILIES: [ModelFamily; 3] =
    [ModelFamily::Lasso, ModelFamily::LightGbm, ModelFamily::XgBoost];

impl ModelFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lasso => "lasso",
            Self::LightGbm => "lightgbm",
            Self::XgBoost => "xgboost",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_model_family(input: &str) -> Result<ModelFamily, ModelError> {
    match input.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
        "lasso" => Ok(ModelFamily::Lasso),
        "lightgbm" | "lgbm" => Ok(ModelFamily::LightGbm),
        "xgboost" | "xgb" => Ok(ModelFamily::XgBoost),
        _ => Err(ModelError::UnknownFamily(input.to_string())),
    }
}

impl FromStr for ModelFamily {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_model_family(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("unknown model family: {0}")]
    UnknownFamily(String),
    #[error("invalid hyperparameter {name}={value}: {reason}")]
    InvalidHyperparameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
    #[error("invalid training set: {0}")]
    InvalidTrainingSet(String),
    #[error("expected {expected} features, got {actual}")]
    FeatureCount { expected: usize, actual: usize },
    #[error("fit diverged: {0}")]
    NonFinite(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamScale {
    Linear,
    Log,
}

/// One searchable hyperparameter dimension, sampled within `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamRange {
    pub name: &'static str,
    pub low: f64,
    pub high: f64,
    pub scale: ParamScale,
    pub integer: bool,
}

pub type ParamSample = BTreeMap<String, f64>;

/// Borrowed feature matrix plus targets, validated for shape and finiteness.
#[derive(Debug, Clone)]
pub struct TrainingSet<'a> {
    features: Vec<&'a [f64]>,
    targets: Vec<f64>,
    n_features: usize,
}

impl<'a> TrainingSet<'a> {
    pub fn new(features: Vec<&'a [f64]>, targets: Vec<f64>) -> Result<Self, ModelError> {
        if features.is_empty() {
            return Err(ModelError::InvalidTrainingSet("no rows".to_string()));
        }
        if features.len() != targets.len() {
            return Err(ModelError::InvalidTrainingSet(format!(
                "{} feature rows but {} targets",
                features.len(),
                targets.len()
            )));
        }
        let n_features = features[0].len();
        if n_features == 0 {
            return Err(ModelError::InvalidTrainingSet("rows have no features".to_string()));
        }
        if let Some(row) = features.iter().find(|row| row.len() != n_features) {
            return Err(ModelError::FeatureCount {
                expected: n_features,
                actual: row.len(),
            });
        }
        if targets.iter().any(|t| !t.is_finite()) {
            return Err(ModelError::InvalidTrainingSet("non-finite target".to_string()));
        }

        Ok(Self {
            features,
            targets,
            n_features,
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        self.features[idx]
    }

    pub fn targets(&self) -> &[f64] {
        &self.targets
    }
}

/// Capability every model family provides.
pub trait Regressor: Sized {
    type Params: Clone + Default + Serialize;

    const FAMILY: ModelFamily;

    fn hyperparameter_space() -> Vec<ParamRange>;

    /// Missing keys keep their default values.
    fn params_from_sample(sample: &ParamSample) -> Self::Params;

    fn fit(params: &Self::Params, data: &TrainingSet<'_>, seed: u64) -> Result<Self, ModelError>;

    fn predict(&self, features: &[f64]) -> Result<f64, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Hyperparameters {
    Lasso(LassoParams),
    LightGbm(LightGbmParams),
    XgBoost(XgBoostParams),
}

impl Hyperparameters {
    pub fn default_for(family: ModelFamily) -> Self {
        match family {
            ModelFamily::Lasso => Self::Lasso(LassoParams::default()),
            ModelFamily::LightGbm => Self::LightGbm(LightGbmParams::default()),
            ModelFamily::XgBoost => Self::XgBoost(XgBoostParams::default()),
        }
    }

    pub fn from_sample(family: ModelFamily, sample: &ParamSample) -> Self {
        match family {
            ModelFamily::Lasso => Self::Lasso(LassoModel::params_from_sample(sample)),
            ModelFamily::LightGbm => Self::LightGbm(LightGbmModel::params_from_sample(sample)),
            ModelFamily::XgBoost => Self::XgBoost(XgBoostModel::params_from_sample(sample)),
        }
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Lasso(_) => ModelFamily::Lasso,
            Self::LightGbm(_) => ModelFamily::LightGbm,
            Self::XgBoost(_) => ModelFamily::XgBoost,
        }
    }
}

pub fn hyperparameter_space(family: ModelFamily) -> Vec<ParamRange> {
    match family {
        ModelFamily::Lasso => LassoModel::hyperparameter_space(),
        ModelFamily::LightGbm => LightGbmModel::hyperparameter_space(),
        ModelFamily::XgBoost => XgBoostModel::hyperparameter_space(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum FittedModel {
    Lasso(LassoModel),
    LightGbm(LightGbmModel),
    XgBoost(XgBoostModel),
}

impl FittedModel {
    pub fn fit(
        params: &Hyperparameters,
        data: &TrainingSet<'_>,
        seed: u64,
    ) -> Result<Self, ModelError> {
        Ok(match params {
            Hyperparameters::Lasso(p) => Self::Lasso(LassoModel::fit(p, data, seed)?),
            Hyperparameters::LightGbm(p) => Self::LightGbm(LightGbmModel::fit(p, data, seed)?),
            Hyperparameters::XgBoost(p) => Self::XgBoost(XgBoostModel::fit(p, data, seed)?),
        })
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Lasso(_) => ModelFamily::Lasso,
            Self::LightGbm(_) => ModelFamily::LightGbm,
            Self::XgBoost(_) => ModelFamily::XgBoost,
        }
    }

    pub fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        match self {
            Self::Lasso(model) => model.predict(features),
            Self::LightGbm(model) => model.predict(features),
            Self::XgBoost(model) => model.predict(features),
        }
    }

    /// Counts are non-negative; raw regression output is clamped at zero.
    pub fn predict_count(&self, features: &[f64]) -> Result<f64, ModelError> {
        Ok(self.predict(features)?.max(0.0))
    }
}

pub(crate) fn check_range(
    name: &'static str,
    value: f64,
    low: f64,
    high: f64,
    reason: &'static str,
) -> Result<(), ModelError> {
    if value.is_finite() && value >= low && value <= high {
        Ok(())
    } else {
        Err(ModelError::InvalidHyperparameter {
            name,
            value,
            reason,
        })
    }
}

pub(crate) fn sample_value(sample: &ParamSample, name: &str, default: f64) -> f64 {
    sample.get(name).copied().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_names_parse_with_common_spellings() {
        assert_eq!(parse_model_family("LightGBM").unwrap(), ModelFamily::LightGbm);
        assert_eq!(parse_model_family("xgb").unwrap(), ModelFamily::XgBoost);
        assert_eq!(parse_model_family("light-gbm").unwrap(), ModelFamily::LightGbm);
        assert!(matches!(
            parse_model_family("prophet"),
            Err(ModelError::UnknownFamily(_))
        ));
    }

    #[test]
    fn training_set_rejects_ragged_rows() {
        let a = [1.0, 2.0];
        let b = [1.0];
        let err = TrainingSet::new(vec![&a[..], &b[..]], vec![1.0, 2.0]).unwrap_err();
        assert_eq!(err, ModelError::FeatureCount { expected: 2, actual: 1 });
    }

    #[test]
    fn hyperparameters_serialize_with_family_tag() {
        let json = serde_json::to_value(Hyperparameters::default_for(ModelFamily::Lasso)).unwrap();
        assert_eq!(json["family"], "lasso");
        let back: Hyperparameters = serde_json::from_value(json).unwrap();
        assert_eq!(back.family(), ModelFamily::Lasso);
    }

    #[test]
    fn predict_count_clamps_negative_output() {
        let rows: Vec<[f64; 1]> = vec![[0.0], [1.0], [2.0], [3.0]];
        let features: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let data = TrainingSet::new(features, vec![3.0, 2.0, 1.0, 0.0]).unwrap();
        let params = Hyperparameters::Lasso(LassoParams {
            alpha: 0.0,
            ..LassoParams::default()
        });
        let model = FittedModel::fit(&params, &data, 7).unwrap();
        assert!(model.predict(&[10.0]).unwrap() < 0.0);
        assert_eq!(model.predict_count(&[10.0]).unwrap(), 0.0);
    }
}
