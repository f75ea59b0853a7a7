//! Crowdiness scoring
//!
//! Maps aggregated features to an index in [0, 1]. The strategy is fixed at
//! construction; the pipeline only sees `CrowdinessEstimator::score`.

use crate::domain::types::AggregatedFeatures;
use crate::infra::config::{Config, ConfigError, ScorerStrategy};
use crate::services::model::RegressionModel;
use tracing::info;

/// One way of turning features into a crowdiness value
pub trait OccupancyScorer: Send + Sync {
    /// Raw score; the estimator clamps it
    fn score(&self, features: &AggregatedFeatures) -> f64;

    fn name(&self) -> &'static str;
}

/// Expected sensor ranges used to normalize raw readings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationRanges {
    pub sound_min_db: f64,
    pub sound_max_db: f64,
    pub co2_min_ppm: f64,
    pub co2_max_ppm: f64,
}

impl Default for NormalizationRanges {
    fn default() -> Self {
        Self { sound_min_db: 30.0, sound_max_db: 75.0, co2_min_ppm: 400.0, co2_max_ppm: 1200.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub motion: f64,
    pub sound: f64,
    pub co2: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self { motion: 0.4, sound: 0.3, co2: 0.3 }
    }
}

/// Clamp into [0, 1]; NaN maps to 0
#[inline]
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Linear rescale of `value` from [min, max] into [0, 1], clamped
#[inline]
pub fn normalize(value: f64, min: f64, max: f64) -> f64 {
    clamp_unit((value - min) / (max - min))
}

/// Fixed weighted sum of normalized features
#[derive(Debug, Clone)]
pub struct WeightedScorer {
    ranges: NormalizationRanges,
    weights: ScoreWeights,
}

impl WeightedScorer {
    pub fn new(ranges: NormalizationRanges, weights: ScoreWeights) -> Self {
        Self { ranges, weights }
    }
}

impl Default for WeightedScorer {
    fn default() -> Self {
        Self::new(NormalizationRanges::default(), ScoreWeights::default())
    }
}

impl OccupancyScorer for WeightedScorer {
    fn score(&self, f: &AggregatedFeatures) -> f64 {
        let motion = clamp_unit(f.motion_rate);
        let sound = normalize(f.avg_sound, self.ranges.sound_min_db, self.ranges.sound_max_db);
        let co2 = normalize(f.avg_co2, self.ranges.co2_min_ppm, self.ranges.co2_max_ppm);

        self.weights.motion * motion + self.weights.sound * sound + self.weights.co2 * co2
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}

/// Delegates to an externally trained regression model
#[derive(Debug, Clone)]
pub struct ModelScorer {
    model: RegressionModel,
}

impl ModelScorer {
    pub fn new(model: RegressionModel) -> Self {
        Self { model }
    }
}

impl OccupancyScorer for ModelScorer {
    fn score(&self, features: &AggregatedFeatures) -> f64 {
        self.model.predict(features)
    }

    fn name(&self) -> &'static str {
        "model"
    }
}

/// Strategy-agnostic scorer handed to every doorway pipeline
pub struct CrowdinessEstimator {
    inner: Box<dyn OccupancyScorer>,
}

impl CrowdinessEstimator {
    pub fn new(inner: Box<dyn OccupancyScorer>) -> Self {
        Self { inner }
    }

    /// Build the configured strategy, loading the model artifact if needed
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let inner: Box<dyn OccupancyScorer> = match config.scorer_strategy() {
            ScorerStrategy::Weighted => {
                Box::new(WeightedScorer::new(config.normalization_ranges(), config.score_weights()))
            }
            ScorerStrategy::Model => {
                let path = config.model_path().ok_or_else(|| ConfigError::Invalid {
                    field: "scorer.model_path",
                    reason: "required when strategy = \"model\"".to_string(),
                })?;
                let model = RegressionModel::from_file(path)
                    .map_err(|source| ConfigError::Model { path: path.to_string(), source })?;
                info!(path = %path, kind = %model.kind(), "model_loaded");
                Box::new(ModelScorer::new(model))
            }
        };
        Ok(Self { inner })
    }

    /// Crowdiness in [0, 1] whatever the strategy returns
    pub fn score(&self, features: &AggregatedFeatures) -> f64 {
        clamp_unit(self.inner.score(features))
    }

    pub fn strategy(&self) -> &'static str {
        self.inner.name()
    }
}
