use ndarray::ArrayView3;

use crate::analysis::features::edge_density;
use crate::imaging::color::{self, HsvRange};

const SKIN_RANGES: [HsvRange; 3] = [
    HsvRange::new([0, 15, 50], [25, 255, 255]),
    HsvRange::new([170, 15, 50], [180, 255, 255]),
    // very light tones, common on faces
    HsvRange::new([0, 0, 100], [180, 30, 255]),
];

const MIN_SKIN_PERCENT: f32 = 10.0;
const MIN_VARIANCE: f32 = 50.0;
const LENIENT_SKIN_PERCENT: f32 = 8.0;
const LENIENT_VARIANCE: f32 = 30.0;
const SMOOTH_EDGE_DENSITY: f32 = 0.03;
const BUSY_EDGE_DENSITY: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct Relevance {
    pub relevant: bool,
    pub reason: String,
}

/// Cheap skin-presence heuristic that decides whether an upload is worth classifying.
#[derive(Debug, Clone, Default)]
pub struct RelevanceDetector;

impl RelevanceDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, image: ArrayView3<f32>) -> Relevance {
        let rgb = match color::to_rgb8(image) {
            Ok(rgb) => rgb,
            Err(e) => {
                log::debug!("Relevance check rejected pixel layout: {}", e);
                return Relevance {
                    relevant: false,
                    reason: "Image must be a 3-channel RGB image".into(),
                };
            }
        };

        let skin_percentage = color::hsv_mask_fraction(&rgb, &SKIN_RANGES) * 100.0;
        let gray = color::to_gray(&rgb);
        let variance = color::gray_variance(&gray);

        let relevant = (skin_percentage >= MIN_SKIN_PERCENT && variance > MIN_VARIANCE)
            || (skin_percentage >= LENIENT_SKIN_PERCENT && variance > LENIENT_VARIANCE);

        log::debug!(
            "Relevance check: skin {:.1}%, gray variance {:.1}, relevant {}",
            skin_percentage,
            variance,
            relevant
        );

        if relevant {
            return Relevance {
                relevant: true,
                reason: "Image appears to contain human skin (face, arms, legs, neck, or torso)"
                    .into(),
            };
        }

        let mut reasons = Vec::new();
        if skin_percentage < MIN_SKIN_PERCENT {
            reasons.push(format!(
                "insufficient skin-colored pixels ({:.1}%)",
                skin_percentage
            ));
        }
        match edge_density(&gray) {
            Ok(density) if density < SMOOTH_EDGE_DENSITY => {
                reasons.push("image appears too smooth/uniform".into())
            }
            Ok(density) if density > BUSY_EDGE_DENSITY => {
                reasons.push("image appears too complex/textured".into())
            }
            _ => {}
        }
        if variance <= MIN_VARIANCE {
            reasons.push("image lacks sufficient detail".into());
        }

        Relevance {
            relevant: false,
            reason: format!(
                "Uploaded image does not appear to be human skin. Reasons: {}. \
                 Please upload a clear photo of affected skin area (face, arms, legs, neck, or torso).",
                reasons.join(", ")
            ),
        }
    }
}
