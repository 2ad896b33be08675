//! Gradient-boosted regression trees on squared loss.
//!
//! Two growth policies share one tree builder:
//! - leaf-wise (LightGBM style): always split the leaf with the highest gain, up to `num_leaves`
//! - depth-wise (XGBoost style): split every leaf with positive gain, up to `max_depth`
//!
//! Split search is exact. Missing values (NaN) always route to the left child.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::{
    check_range, sample_value, ModelError, ModelFamily, ParamRange, ParamSample, ParamScale,
    Regressor, TrainingSet,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightGbmParams {
    pub n_estimators: u32,
    pub learning_rate: f64,
    pub num_leaves: u32,
    pub min_child_samples: u32,
    pub lambda_l2: f64,
    pub colsample_bytree: f64,
}

impl Default for LightGbmParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            num_leaves: 31,
            min_child_samples: 20,
            lambda_l2: 0.0,
            colsample_bytree: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XgBoostParams {
    pub n_estimators: u32,
    pub learning_rate: f64,
    pub max_depth: u32,
    pub min_child_weight: f64,
    pub lambda: f64,
    pub gamma: f64,
    pub colsample_bytree: f64,
}

impl Default for XgBoostParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.3,
            max_depth: 6,
            min_child_weight: 1.0,
            lambda: 1.0,
            gamma: 0.0,
            colsample_bytree: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct GrowthConfig {
    n_estimators: u32,
    learning_rate: f64,
    max_leaves: Option<u32>,
    max_depth: Option<u32>,
    min_child_weight: f64,
    lambda: f64,
    gamma: f64,
    colsample_bytree: f64,
}

impl GrowthConfig {
    fn validate(&self) -> Result<(), ModelError> {
        if self.n_estimators == 0 {
            return Err(ModelError::InvalidHyperparameter {
                name: "n_estimators",
                value: 0.0,
                reason: "must be > 0",
            });
        }
        check_range("learning_rate", self.learning_rate, f64::MIN_POSITIVE, 1.0, "must be in (0, 1]")?;
        check_range("min_child_weight", self.min_child_weight, 0.0, f64::MAX, "must be >= 0")?;
        check_range("lambda", self.lambda, 0.0, f64::MAX, "must be >= 0")?;
        check_range("gamma", self.gamma, 0.0, f64::MAX, "must be >= 0")?;
        check_range(
            "colsample_bytree",
            self.colsample_bytree,
            f64::MIN_POSITIVE,
            1.0,
            "must be in (0, 1]",
        )?;
        if let Some(leaves) = self.max_leaves {
            if leaves < 2 {
                return Err(ModelError::InvalidHyperparameter {
                    name: "num_leaves",
                    value: leaves as f64,
                    reason: "must be >= 2",
                });
            }
        }
        if self.max_depth == Some(0) {
            return Err(ModelError::InvalidHyperparameter {
                name: "max_depth",
                value: 0.0,
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

impl From<&LightGbmParams> for GrowthConfig {
    fn from(p: &LightGbmParams) -> Self {
        Self {
            n_estimators: p.n_estimators,
            learning_rate: p.learning_rate,
            max_leaves: Some(p.num_leaves),
            max_depth: None,
            min_child_weight: p.min_child_samples as f64,
            lambda: p.lambda_l2,
            gamma: 0.0,
            colsample_bytree: p.colsample_bytree,
        }
    }
}

impl From<&XgBoostParams> for GrowthConfig {
    fn from(p: &XgBoostParams) -> Self {
        Self {
            n_estimators: p.n_estimators,
            learning_rate: p.learning_rate,
            max_leaves: None,
            max_depth: Some(p.max_depth),
            min_child_weight: p.min_child_weight,
            lambda: p.lambda,
            gamma: p.gamma,
            colsample_bytree: p.colsample_bytree,
        }
    }
}

/// A node in a fitted tree. Leaves carry `value`; splits carry `feature`, `threshold` and children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionNode {
    pub feature: Option<usize>,
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
    pub value: f64,
}

impl RegressionNode {
    fn leaf(value: f64) -> Self {
        Self {
            feature: None,
            threshold: 0.0,
            left: 0,
            right: 0,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTrees {
    base_score: f64,
    learning_rate: f64,
    n_features: usize,
    trees: Vec<Vec<RegressionNode>>,
}

impl BoostedTrees {
    fn fit(cfg: GrowthConfig, data: &TrainingSet<'_>, seed: u64) -> Result<Self, ModelError> {
        cfg.validate()?;

        let n = data.len();
        let p = data.n_features();
        let targets = data.targets();
        let base_score = targets.iter().sum::<f64>() / n as f64;
        let mut predictions = vec![base_score; n];
        let mut gradients = vec![0.0; n];
        let mut rng = StdRng::seed_from_u64(seed);
        let columns_per_tree = ((p as f64 * cfg.colsample_bytree).ceil() as usize).clamp(1, p);

        let mut trees = Vec::with_capacity(cfg.n_estimators as usize);
        for _ in 0..cfg.n_estimators {
            for i in 0..n {
                gradients[i] = predictions[i] - targets[i];
            }

            let mut columns: Vec<usize> = if columns_per_tree == p {
                (0..p).collect()
            } else {
                rand::seq::index::sample(&mut rng, p, columns_per_tree).into_vec()
            };
            columns.sort_unstable();

            let tree = grow_tree(&cfg, data, &gradients, &columns);
            if tree.iter().any(|node| !node.value.is_finite()) {
                return Err(ModelError::NonFinite("leaf value is not finite".to_string()));
            }
            for (i, prediction) in predictions.iter_mut().enumerate() {
                *prediction += cfg.learning_rate * traverse(&tree, data.row(i));
            }
            trees.push(tree);
        }

        Ok(Self {
            base_score,
            learning_rate: cfg.learning_rate,
            n_features: p,
            trees,
        })
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        if features.len() != self.n_features {
            return Err(ModelError::FeatureCount {
                expected: self.n_features,
                actual: features.len(),
            });
        }
        Ok(self.base_score
            + self.learning_rate
                * self
                    .trees
                    .iter()
                    .map(|tree| traverse(tree, features))
                    .sum::<f64>())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightGbmModel(BoostedTrees);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XgBoostModel(BoostedTrees);

impl LightGbmModel {
    pub fn trees(&self) -> &BoostedTrees {
        &self.0
    }
}

impl XgBoostModel {
    pub fn trees(&self) -> &BoostedTrees {
        &self.0
    }
}

impl Regressor for LightGbmModel {
    type Params = LightGbmParams;

    const FAMILY: ModelFamily = ModelFamily::LightGbm;

    fn hyperparameter_space() -> Vec<ParamRange> {
        vec![
            range("n_estimators", 50.0, 300.0, ParamScale::Linear, true),
            range("learning_rate", 0.01, 0.3, ParamScale::Log, false),
            range("num_leaves", 8.0, 64.0, ParamScale::Linear, true),
            range("min_child_samples", 5.0, 50.0, ParamScale::Linear, true),
            range("lambda_l2", 0.0, 5.0, ParamScale::Linear, false),
            range("colsample_bytree", 0.5, 1.0, ParamScale::Linear, false),
        ]
    }

    fn params_from_sample(sample: &ParamSample) -> Self::Params {
        let d = LightGbmParams::default();
        LightGbmParams {
            n_estimators: sample_value(sample, "n_estimators", d.n_estimators as f64) as u32,
            learning_rate: sample_value(sample, "learning_rate", d.learning_rate),
            num_leaves: sample_value(sample, "num_leaves", d.num_leaves as f64) as u32,
            min_child_samples: sample_value(sample, "min_child_samples", d.min_child_samples as f64)
                as u32,
            lambda_l2: sample_value(sample, "lambda_l2", d.lambda_l2),
            colsample_bytree: sample_value(sample, "colsample_bytree", d.colsample_bytree),
        }
    }

    fn fit(params: &Self::Params, data: &TrainingSet<'_>, seed: u64) -> Result<Self, ModelError> {
        BoostedTrees::fit(GrowthConfig::from(params), data, seed).map(Self)
    }

    fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        self.0.predict(features)
    }
}

impl Regressor for XgBoostModel {
    type Params = XgBoostParams;

    const FAMILY: ModelFamily = ModelFamily::XgBoost;

    fn hyperparameter_space() -> Vec<ParamRange> {
        vec![
            range("n_estimators", 50.0, 300.0, ParamScale::Linear, true),
            range("learning_rate", 0.01, 0.3, ParamScale::Log, false),
            range("max_depth", 3.0, 10.0, ParamScale::Linear, true),
            range("min_child_weight", 1.0, 10.0, ParamScale::Linear, false),
            range("lambda", 0.1, 10.0, ParamScale::Log, false),
            range("gamma", 0.0, 1.0, ParamScale::Linear, false),
            range("colsample_bytree", 0.5, 1.0, ParamScale::Linear, false),
        ]
    }

    fn params_from_sample(sample: &ParamSample) -> Self::Params {
        let d = XgBoostParams::default();
        XgBoostParams {
            n_estimators: sample_value(sample, "n_estimators", d.n_estimators as f64) as u32,
            learning_rate: sample_value(sample, "learning_rate", d.learning_rate),
            max_depth: sample_value(sample, "max_depth", d.max_depth as f64) as u32,
            min_child_weight: sample_value(sample, "min_child_weight", d.min_child_weight),
            lambda: sample_value(sample, "lambda", d.lambda),
            gamma: sample_value(sample, "gamma", d.gamma),
            colsample_bytree: sample_value(sample, "colsample_bytree", d.colsample_bytree),
        }
    }

    fn fit(params: &Self::Params, data: &TrainingSet<'_>, seed: u64) -> Result<Self, ModelError> {
        BoostedTrees::fit(GrowthConfig::from(params), data, seed).map(Self)
    }

    fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        self.0.predict(features)
    }
}

fn range(name: &'static str, low: f64, high: f64, scale: ParamScale, integer: bool) -> ParamRange {
    ParamRange {
        name,
        low,
        high,
        scale,
        integer,
    }
}

fn traverse(nodes: &[RegressionNode], features: &[f64]) -> f64 {
    let mut idx = 0;
    loop {
        let node = &nodes[idx];
        match node.feature {
            None => return node.value,
            Some(feature) => {
                let value = features[feature];
                idx = if value.is_nan() || value <= node.threshold {
                    node.left
                } else {
                    node.right
                };
            }
        }
    }
}

struct SplitChoice {
    feature: usize,
    threshold: f64,
    gain: f64,
    left_rows: Vec<usize>,
    right_rows: Vec<usize>,
}

struct OpenLeaf {
    node: usize,
    depth: u32,
    split: SplitChoice,
}

fn grow_tree(
    cfg: &GrowthConfig,
    data: &TrainingSet<'_>,
    gradients: &[f64],
    columns: &[usize],
) -> Vec<RegressionNode> {
    let root_rows: Vec<usize> = (0..data.len()).collect();
    let mut nodes = vec![RegressionNode::leaf(leaf_value(cfg, gradients, &root_rows))];
    let mut open = Vec::new();
    if let Some(split) = best_split(cfg, data, gradients, columns, &root_rows, 0) {
        open.push(OpenLeaf {
            node: 0,
            depth: 0,
            split,
        });
    }
    let mut leaves = 1u32;

    while !open.is_empty() {
        if cfg.max_leaves.map(|max| leaves >= max).unwrap_or(false) {
            break;
        }

        let best_idx = open
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.split.gain.total_cmp(&b.1.split.gain))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        let leaf = open.swap_remove(best_idx);
        let split = leaf.split;

        let left = nodes.len();
        let right = left + 1;
        nodes.push(RegressionNode::leaf(leaf_value(cfg, gradients, &split.left_rows)));
        nodes.push(RegressionNode::leaf(leaf_value(cfg, gradients, &split.right_rows)));
        nodes[leaf.node] = RegressionNode {
            feature: Some(split.feature),
            threshold: split.threshold,
            left,
            right,
            value: nodes[leaf.node].value,
        };
        leaves += 1;

        let child_depth = leaf.depth + 1;
        for (node, rows) in [(left, split.left_rows), (right, split.right_rows)] {
            if let Some(child_split) = best_split(cfg, data, gradients, columns, &rows, child_depth)
            {
                open.push(OpenLeaf {
                    node,
                    depth: child_depth,
                    split: child_split,
                });
            }
        }
    }

    nodes
}

fn leaf_value(cfg: &GrowthConfig, gradients: &[f64], rows: &[usize]) -> f64 {
    let g: f64 = rows.iter().map(|&i| gradients[i]).sum();
    let h = rows.len() as f64;
    -g / (h + cfg.lambda)
}

fn score(g: f64, h: f64, lambda: f64) -> f64 {
    if h + lambda <= 0.0 {
        0.0
    } else {
        g * g / (h + lambda)
    }
}

fn best_split(
    cfg: &GrowthConfig,
    data: &TrainingSet<'_>,
    gradients: &[f64],
    columns: &[usize],
    rows: &[usize],
    depth: u32,
) -> Option<SplitChoice> {
    if cfg.max_depth.map(|max| depth >= max).unwrap_or(false) {
        return None;
    }
    let min_child = cfg.min_child_weight.max(1.0);
    if (rows.len() as f64) < 2.0 * min_child {
        return None;
    }

    let g_total: f64 = rows.iter().map(|&i| gradients[i]).sum();
    let h_total = rows.len() as f64;
    let parent_score = score(g_total, h_total, cfg.lambda);

    let mut best: Option<(usize, f64, f64)> = None;
    let mut sorted: Vec<(f64, f64)> = Vec::with_capacity(rows.len());
    for &feature in columns {
        sorted.clear();
        let mut g_missing = 0.0;
        let mut h_missing = 0.0;
        for &i in rows {
            let value = data.row(i)[feature];
            if value.is_nan() {
                g_missing += gradients[i];
                h_missing += 1.0;
            } else {
                sorted.push((value, gradients[i]));
            }
        }
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut g_left = g_missing;
        let mut h_left = h_missing;
        for k in 0..sorted.len().saturating_sub(1) {
            g_left += sorted[k].1;
            h_left += 1.0;
            if sorted[k].0 == sorted[k + 1].0 {
                continue;
            }
            let h_right = h_total - h_left;
            if h_left < min_child || h_right < min_child {
                continue;
            }
            let g_right = g_total - g_left;
            let gain = 0.5
                * (score(g_left, h_left, cfg.lambda) + score(g_right, h_right, cfg.lambda)
                    - parent_score)
                - cfg.gamma;
            if gain > 1e-12 && best.map(|(_, _, b)| gain > b).unwrap_or(true) {
                let threshold = sorted[k].0 + (sorted[k + 1].0 - sorted[k].0) / 2.0;
                best = Some((feature, threshold, gain));
            }
        }
    }

    let (feature, threshold, gain) = best?;
    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows.iter().partition(|&&i| {
        let value = data.row(i)[feature];
        value.is_nan() || value <= threshold
    });

    Some(SplitChoice {
        feature,
        threshold,
        gain,
        left_rows,
        right_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_data() -> (Vec<[f64; 2]>, Vec<f64>) {
        let rows: Vec<[f64; 2]> = (0..40).map(|i| [i as f64, (i % 5) as f64]).collect();
        let targets = rows
            .iter()
            .map(|r| if r[0] < 20.0 { 2.0 } else { 10.0 })
            .collect();
        (rows, targets)
    }

    #[test]
    fn depth_wise_trees_learn_a_step() {
        let (rows, targets) = step_data();
        let features: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let data = TrainingSet::new(features, targets).unwrap();
        let model = XgBoostModel::fit(
            &XgBoostParams {
                n_estimators: 50,
                lambda: 0.0,
                ..XgBoostParams::default()
            },
            &data,
            1,
        )
        .unwrap();
        assert!((model.predict(&[5.0, 0.0]).unwrap() - 2.0).abs() < 0.05);
        assert!((model.predict(&[35.0, 0.0]).unwrap() - 10.0).abs() < 0.05);
    }

    #[test]
    fn leaf_wise_respects_leaf_budget() {
        let (rows, targets) = step_data();
        let features: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let data = TrainingSet::new(features, targets).unwrap();
        let model = LightGbmModel::fit(
            &LightGbmParams {
                n_estimators: 5,
                num_leaves: 3,
                min_child_samples: 2,
                ..LightGbmParams::default()
            },
            &data,
            1,
        )
        .unwrap();
        for tree in &model.trees().trees {
            let leaves = tree.iter().filter(|n| n.feature.is_none()).count();
            assert!(leaves <= 3);
        }
    }

    #[test]
    fn missing_values_route_left() {
        let nodes = vec![
            RegressionNode {
                feature: Some(0),
                threshold: 1.0,
                left: 1,
                right: 2,
                value: 0.0,
            },
            RegressionNode::leaf(-1.0),
            RegressionNode::leaf(1.0),
        ];
        assert_eq!(traverse(&nodes, &[f64::NAN]), -1.0);
        assert_eq!(traverse(&nodes, &[2.0]), 1.0);
    }

    #[test]
    fn same_seed_gives_identical_models_with_column_sampling() {
        let (rows, targets) = step_data();
        let features: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let data = TrainingSet::new(features, targets).unwrap();
        let params = XgBoostParams {
            n_estimators: 10,
            colsample_bytree: 0.5,
            ..XgBoostParams::default()
        };
        let a = XgBoostModel::fit(&params, &data, 42).unwrap();
        let b = XgBoostModel::fit(&params, &data, 42).unwrap();
        assert_eq!(a, b);
    }
}
