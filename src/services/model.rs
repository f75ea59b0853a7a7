//! Learned crowdiness model loaded from a JSON artifact
//!
//! The artifact is produced offline from recorded datasets. Two shapes are
//! understood:
//!
//! ```json
//! {"kind": "linear", "intercept": -0.9, "motion_rate": 0.4, "avg_sound": 0.007, "avg_co2": 0.0004}
//! ```
//!
//! ```json
//! {"kind": "forest", "trees": [{"nodes": [
//!     {"type": "split", "feature": "avg_co2", "threshold": 800.0, "left": 1, "right": 2},
//!     {"type": "leaf", "value": 0.2},
//!     {"type": "leaf", "value": 0.8}
//! ]}]}
//! ```
//!
//! Forest prediction is the mean of the tree outputs. Samples with
//! `feature <= threshold` go left. Child indices must point forward.

use crate::domain::types::AggregatedFeatures;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid model artifact: {0}")]
    Invalid(String),
}

/// Input feature selector for tree splits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    MotionRate,
    AvgSound,
    AvgCo2,
}

impl Feature {
    #[inline]
    fn value(self, features: &AggregatedFeatures) -> f64 {
        match self {
            Feature::MotionRate => features.motion_rate,
            Feature::AvgSound => features.avg_sound,
            Feature::AvgCo2 => features.avg_co2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub motion_rate: f64,
    pub avg_sound: f64,
    pub avg_co2: f64,
}

impl LinearModel {
    fn predict(&self, f: &AggregatedFeatures) -> f64 {
        self.intercept
            + self.motion_rate * f.motion_rate
            + self.avg_sound * f.avg_sound
            + self.avg_co2 * f.avg_co2
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    Split { feature: Feature, threshold: f64, left: usize, right: usize },
    Leaf { value: f64 },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

impl RegressionTree {
    fn predict(&self, f: &AggregatedFeatures) -> f64 {
        let mut idx = 0;
        // Validation guarantees forward-only child indices, so this terminates
        while let Some(node) = self.nodes.get(idx) {
            match node {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split { feature, threshold, left, right } => {
                    idx = if feature.value(f) <= *threshold { *left } else { *right };
                }
            }
        }
        f64::NAN
    }

    fn validate(&self, tree_idx: usize) -> Result<(), ModelError> {
        if self.nodes.is_empty() {
            return Err(ModelError::Invalid(format!("tree {tree_idx} has no nodes")));
        }
        let len = self.nodes.len();
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Leaf { value } if !value.is_finite() => {
                    return Err(ModelError::Invalid(format!(
                        "tree {tree_idx} node {idx}: non-finite leaf value"
                    )));
                }
                TreeNode::Split { threshold, left, right, .. } => {
                    if !threshold.is_finite() {
                        return Err(ModelError::Invalid(format!(
                            "tree {tree_idx} node {idx}: non-finite threshold"
                        )));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= len {
                            return Err(ModelError::Invalid(format!(
                                "tree {tree_idx} node {idx}: child index {child} out of range"
                            )));
                        }
                    }
                }
                TreeNode::Leaf { .. } => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForestModel {
    pub trees: Vec<RegressionTree>,
}

/// Opaque regression model: features in, crowdiness out
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegressionModel {
    Linear(LinearModel),
    Forest(ForestModel),
}

impl RegressionModel {
    /// Load and validate an artifact from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let model: RegressionModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ModelError> {
        match self {
            RegressionModel::Linear(m) => {
                if [m.intercept, m.motion_rate, m.avg_sound, m.avg_co2].iter().all(|v| v.is_finite())
                {
                    Ok(())
                } else {
                    Err(ModelError::Invalid("non-finite linear coefficient".to_string()))
                }
            }
            RegressionModel::Forest(forest) => {
                if forest.trees.is_empty() {
                    return Err(ModelError::Invalid("forest has no trees".to_string()));
                }
                forest.trees.iter().enumerate().try_for_each(|(i, tree)| tree.validate(i))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegressionModel::Linear(_) => "linear",
            RegressionModel::Forest(_) => "forest",
        }
    }

    /// Raw model output, not clamped
    pub fn predict(&self, features: &AggregatedFeatures) -> f64 {
        match self {
            RegressionModel::Linear(m) => m.predict(features),
            RegressionModel::Forest(forest) => {
                let sum: f64 = forest.trees.iter().map(|t| t.predict(features)).sum();
                sum / forest.trees.len() as f64
            }
        }
    }
}
