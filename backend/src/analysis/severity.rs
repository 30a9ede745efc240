use ndarray::ArrayView3;
use shared::SeverityLevel;

use crate::analysis::features::{Extraction, FeatureExtractor, VisualFeatures};
use crate::config::SeverityConfig;

const PROBABILITY_WEIGHT: f32 = 0.4;
const REDNESS_WEIGHT: f32 = 0.3;
const AREA_WEIGHT: f32 = 0.2;
const TEXTURE_WEIGHT: f32 = 0.1;

/// Grades confirmed eczema as Mild, Moderate or Severe.
#[derive(Debug, Clone)]
pub struct SeverityEstimator {
    config: SeverityConfig,
}

impl SeverityEstimator {
    pub fn new(config: SeverityConfig) -> Self {
        Self { config }
    }

    pub fn estimate(&self, image: ArrayView3<f32>, probability: f32) -> SeverityLevel {
        let extraction = FeatureExtractor::new().extract(image);
        self.estimate_features(&extraction, probability)
    }

    pub fn estimate_features(&self, extraction: &Extraction, probability: f32) -> SeverityLevel {
        match extraction {
            Ok(features) => self.grade(combined_score(features, probability)),
            Err(e) => {
                log::warn!("Severity falling back to probability alone: {}", e);
                self.grade(probability)
            }
        }
    }

    fn grade(&self, score: f32) -> SeverityLevel {
        if score >= self.config.severe_threshold {
            SeverityLevel::Severe
        } else if score >= self.config.moderate_threshold {
            SeverityLevel::Moderate
        } else {
            SeverityLevel::Mild
        }
    }
}

/// Weighted blend of model confidence and visual evidence, in [0, 1].
pub fn combined_score(features: &VisualFeatures, probability: f32) -> f32 {
    probability.clamp(0.0, 1.0) * PROBABILITY_WEIGHT
        + features.redness_ratio * REDNESS_WEIGHT
        + features.affected_area_ratio * AREA_WEIGHT
        + features.texture_irregularity() * TEXTURE_WEIGHT
}
