//! Out-of-distribution and ambiguity checks on the classifier probability.
//!
//! Probabilities at or beyond the configured high/low thresholds are trusted
//! outright. Anything in between accumulates weighted evidence and is only
//! routed to `Uncertain` when the evidence reaches `min_uncertainty_factors`.

use ndarray::ArrayView3;

use crate::analysis::features::{Extraction, Feature, FeatureExtractor, VisualFeatures};
use crate::config::UncertaintyConfig;

const AMBIGUOUS_RANGE: &str = "confidence falls in ambiguous range";
const ABNORMAL_TEXTURE: &str = "texture patterns are inconsistent";
const PATTERN_MISMATCH: &str = "visual patterns don't match eczema";
const VISUAL_INCONSISTENCY: &str = "visual features inconsistent with confidence";

const AMBIGUOUS_WEIGHT: u32 = 2;
const SUPPORTING_WEIGHT: u32 = 1;

const EXPECTED_EDGE_DENSITY: f32 = 0.15;
const EDGE_TOLERANCE: f32 = 0.3;
const MAX_CONFIDENCE_VISUAL_GAP: f32 = 0.4;
const FAIL_SAFE_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn of(probability: f32, high_threshold: f32, low_threshold: f32) -> Self {
        if probability >= high_threshold {
            ConfidenceBand::High
        } else if probability <= low_threshold {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::Medium
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "high",
            ConfidenceBand::Medium => "medium",
            ConfidenceBand::Low => "low",
        }
    }
}

/// One piece of evidence against trusting the probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UncertaintyFactor {
    pub description: &'static str,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UncertaintyVerdict {
    pub is_uncertain: bool,
    pub reason: String,
    pub adjusted_confidence: f32,
    pub factors: Vec<UncertaintyFactor>,
}

impl UncertaintyVerdict {
    fn trusted(probability: f32, factors: Vec<UncertaintyFactor>) -> Self {
        Self {
            is_uncertain: false,
            reason: String::new(),
            adjusted_confidence: probability,
            factors,
        }
    }

    fn fail_safe(reason: String) -> Self {
        Self {
            is_uncertain: true,
            reason,
            adjusted_confidence: FAIL_SAFE_CONFIDENCE,
            factors: Vec::new(),
        }
    }

    pub fn total_weight(&self) -> u32 {
        self.factors.iter().map(|f| f.weight).sum()
    }
}

#[derive(Debug, Clone)]
pub struct UncertaintyDetector {
    config: UncertaintyConfig,
}

impl UncertaintyDetector {
    pub fn new(config: UncertaintyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UncertaintyConfig {
        &self.config
    }

    pub fn confidence_band(&self, probability: f32) -> ConfidenceBand {
        ConfidenceBand::of(
            probability,
            self.config.high_confidence_threshold,
            self.config.low_confidence_threshold,
        )
    }

    pub fn in_ambiguous_band(&self, probability: f32) -> bool {
        (self.config.uncertainty_band_lower..=self.config.uncertainty_band_upper)
            .contains(&probability)
    }

    pub fn evaluate(&self, image: ArrayView3<f32>, probability: f32) -> UncertaintyVerdict {
        let extraction = FeatureExtractor::new().extract(image);
        self.evaluate_features(&extraction, probability)
    }

    pub fn evaluate_features(&self, extraction: &Extraction, probability: f32) -> UncertaintyVerdict {
        let features = match extraction {
            Ok(features) => features,
            Err(e) => {
                log::warn!("Uncertainty analysis failed, routing to Uncertain: {}", e);
                return UncertaintyVerdict::fail_safe(format!("Uncertainty analysis error: {}", e));
            }
        };

        let factors = self.factors(features, probability);
        let total_weight: u32 = factors.iter().map(|f| f.weight).sum();
        let in_band = self.in_ambiguous_band(probability);

        let verdict = if probability >= self.config.high_confidence_threshold
            || probability <= self.config.low_confidence_threshold
        {
            UncertaintyVerdict::trusted(probability, factors)
        } else if in_band && total_weight >= self.config.min_uncertainty_factors {
            let descriptions: Vec<&str> = factors.iter().map(|f| f.description).collect();
            UncertaintyVerdict {
                is_uncertain: true,
                reason: format!(
                    "Uncertain classification: {}. The image may show a different skin \
                     condition or the patterns are ambiguous.",
                    descriptions.join(", ")
                ),
                adjusted_confidence: FAIL_SAFE_CONFIDENCE,
                factors,
            }
        } else {
            UncertaintyVerdict::trusted(probability, factors)
        };

        log::debug!(
            "Uncertainty evaluation: probability {:.4}, in band {}, factors {:?} (weight {}), uncertain {}, adjusted {:.4}",
            probability,
            in_band,
            verdict.factors.iter().map(|f| f.description).collect::<Vec<_>>(),
            total_weight,
            verdict.is_uncertain,
            verdict.adjusted_confidence
        );
        verdict
    }

    /// Every factor that fires for this probability, regardless of threshold precedence.
    pub fn factors(&self, features: &VisualFeatures, probability: f32) -> Vec<UncertaintyFactor> {
        let mut factors = Vec::new();

        if self.in_ambiguous_band(probability) {
            factors.push(UncertaintyFactor {
                description: AMBIGUOUS_RANGE,
                weight: AMBIGUOUS_WEIGHT,
            });
        }

        let variance = features.texture_variance;
        if variance < self.config.texture_variance_low || variance > self.config.texture_variance_high {
            factors.push(UncertaintyFactor {
                description: ABNORMAL_TEXTURE,
                weight: SUPPORTING_WEIGHT,
            });
        }

        // Only reachable when called directly: evaluate_features trusts any
        // probability above the high threshold before looking at factors.
        if probability > self.config.high_confidence_threshold
            && texture_similarity(features, probability)
                < self.config.confidence_texture_mismatch_threshold
        {
            factors.push(UncertaintyFactor {
                description: PATTERN_MISMATCH,
                weight: SUPPORTING_WEIGHT,
            });
        }

        if !is_visually_consistent(features, probability) {
            factors.push(UncertaintyFactor {
                description: VISUAL_INCONSISTENCY,
                weight: SUPPORTING_WEIGHT,
            });
        }

        factors
    }
}

/// How closely edges and redness resemble typical eczema, in [0, 1].
pub fn texture_similarity(features: &VisualFeatures, probability: f32) -> f32 {
    if !features.is_measured(Feature::EdgeDensity) {
        return 0.5;
    }
    let edge_similarity = (1.0
        - (features.edge_density - EXPECTED_EDGE_DENSITY).abs() / EDGE_TOLERANCE)
        .clamp(0.0, 1.0);
    let redness_similarity = if probability > 0.7 && features.red_fraction < 0.1 {
        0.3
    } else {
        (features.red_fraction * 5.0).min(1.0)
    };
    edge_similarity * 0.5 + redness_similarity * 0.5
}

pub fn visual_strength(features: &VisualFeatures) -> f32 {
    (features.edge_density * 0.5 + features.red_fraction * 2.0).min(1.0)
}

fn is_visually_consistent(features: &VisualFeatures, probability: f32) -> bool {
    if !features.is_measured(Feature::EdgeDensity) {
        return true;
    }
    (probability - visual_strength(features)).abs() < MAX_CONFIDENCE_VISUAL_GAP
}
