//! L1-regularized linear regression fitted by cyclic coordinate descent on standardized features.

use serde::{Deserialize, Serialize};

use super::{
    check_range, sample_value, ModelError, ModelFamily, ParamRange, ParamSample, ParamScale,
    Regressor, TrainingSet,
};

const MIN_SCALE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LassoParams {
    pub alpha: f64,
    pub max_iter: u32,
    pub tol: f64,
}

impl Default for LassoParams {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            max_iter: 1_000,
            tol: 1e-6,
        }
    }
}

impl LassoParams {
    fn validate(&self) -> Result<(), ModelError> {
        check_range("alpha", self.alpha, 0.0, 1e6, "must be a finite value >= 0")?;
        check_range("tol", self.tol, f64::MIN_POSITIVE, 1.0, "must be in (0, 1]")?;
        if self.max_iter == 0 {
            return Err(ModelError::InvalidHyperparameter {
                name: "max_iter",
                value: 0.0,
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LassoModel {
    intercept: f64,
    /// Coefficients on standardized features.
    coefficients: Vec<f64>,
    means: Vec<f64>,
    scales: Vec<f64>,
    iterations: u32,
}

impl LassoModel {
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl Regressor for LassoModel {
    type Params = LassoParams;

    const FAMILY: ModelFamily = ModelFamily::Lasso;

    fn hyperparameter_space() -> Vec<ParamRange> {
        vec![ParamRange {
            name: "alpha",
            low: 1e-4,
            high: 10.0,
            scale: ParamScale::Log,
            integer: false,
        }]
    }

    fn params_from_sample(sample: &ParamSample) -> Self::Params {
        let defaults = LassoParams::default();
        LassoParams {
            alpha: sample_value(sample, "alpha", defaults.alpha),
            ..defaults
        }
    }

    fn fit(params: &Self::Params, data: &TrainingSet<'_>, _seed: u64) -> Result<Self, ModelError> {
        params.validate()?;

        let n = data.len();
        let p = data.n_features();
        let n_f = n as f64;

        let mut means = vec![0.0; p];
        let mut scales = vec![1.0; p];
        let mut columns = vec![vec![0.0; n]; p];
        for j in 0..p {
            let finite: Vec<f64> = (0..n)
                .map(|i| data.row(i)[j])
                .filter(|v| v.is_finite())
                .collect();
            if finite.is_empty() {
                continue;
            }
            let mean = finite.iter().sum::<f64>() / finite.len() as f64;
            let var =
                finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / finite.len() as f64;
            means[j] = mean;
            scales[j] = if var.sqrt() > MIN_SCALE { var.sqrt() } else { 1.0 };
            for (i, slot) in columns[j].iter_mut().enumerate() {
                *slot = standardize(data.row(i)[j], mean, scales[j]);
            }
        }

        let intercept = data.targets().iter().sum::<f64>() / n_f;
        let mut residual: Vec<f64> = data.targets().iter().map(|y| y - intercept).collect();
        let col_sq: Vec<f64> = columns
            .iter()
            .map(|col| col.iter().map(|z| z * z).sum::<f64>() / n_f)
            .collect();

        let mut weights = vec![0.0; p];
        let mut iterations = 0;
        for _ in 0..params.max_iter {
            iterations += 1;
            let mut max_delta: f64 = 0.0;
            for j in 0..p {
                if col_sq[j] <= MIN_SCALE {
                    continue;
                }
                let column = &columns[j];
                let rho = column
                    .iter()
                    .zip(&residual)
                    .map(|(z, r)| z * r)
                    .sum::<f64>()
                    / n_f
                    + col_sq[j] * weights[j];
                let updated = soft_threshold(rho, params.alpha) / col_sq[j];
                let delta = updated - weights[j];
                if delta != 0.0 {
                    for (r, z) in residual.iter_mut().zip(column) {
                        *r -= delta * z;
                    }
                    weights[j] = updated;
                }
                max_delta = max_delta.max(delta.abs());
            }
            if max_delta < params.tol {
                break;
            }
        }

        if !intercept.is_finite() || weights.iter().any(|w| !w.is_finite()) {
            return Err(ModelError::NonFinite(
                "lasso coefficients are not finite".to_string(),
            ));
        }

        Ok(Self {
            intercept,
            coefficients: weights,
            means,
            scales,
            iterations,
        })
    }

    fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        if features.len() != self.coefficients.len() {
            return Err(ModelError::FeatureCount {
                expected: self.coefficients.len(),
                actual: features.len(),
            });
        }
        Ok(self.intercept
            + features
                .iter()
                .zip(&self.coefficients)
                .zip(self.means.iter().zip(&self.scales))
                .map(|((x, w), (mean, scale))| w * standardize(*x, *mean, *scale))
                .sum::<f64>())
    }
}

/// Non-finite inputs sit at the column mean.
fn standardize(value: f64, mean: f64, scale: f64) -> f64 {
    if value.is_finite() {
        (value - mean) / scale
    } else {
        0.0
    }
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}
