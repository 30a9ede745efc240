#[cfg(feature = "torch")]
pub mod torch;

use std::path::Path;
use std::sync::Arc;

use ndarray::ArrayView3;
use thiserror::Error;

use crate::config::ModelConfig;

#[cfg(feature = "torch")]
pub use torch::TorchClassifier;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("Model service is not available: {0}")]
    ModelUnavailable(String),
    #[error("Prediction failed: {0}")]
    InferenceFailure(String),
}

/// Binary eczema classifier over a normalized (H, W, 3) image.
pub trait Classifier: Send + Sync {
    /// Probability of eczema in [0, 1].
    fn predict(&self, image: ArrayView3<f32>) -> Result<f32, ClassifierError>;

    fn is_loaded(&self) -> bool;
}

/// Stands in when no model could be loaded.
#[derive(Debug, Clone)]
pub struct UnloadedClassifier {
    reason: String,
}

impl UnloadedClassifier {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Classifier for UnloadedClassifier {
    fn predict(&self, _image: ArrayView3<f32>) -> Result<f32, ClassifierError> {
        Err(ClassifierError::ModelUnavailable(self.reason.clone()))
    }

    fn is_loaded(&self) -> bool {
        false
    }
}

/// Loads the configured model, or an [`UnloadedClassifier`] explaining why not.
pub fn load(config: &ModelConfig) -> Arc<dyn Classifier> {
    if !config.path.exists() {
        log::warn!(
            "Model file not found at {}; analysis requests will be refused",
            config.path.display()
        );
        return Arc::new(UnloadedClassifier::new(format!(
            "model file not found at {}",
            config.path.display()
        )));
    }

    load_model(&config.path)
}

#[cfg(feature = "torch")]
fn load_model(path: &Path) -> Arc<dyn Classifier> {
    match TorchClassifier::load(path) {
        Ok(classifier) => {
            log::info!("Model loaded from {}", path.display());
            Arc::new(classifier)
        }
        Err(e) => {
            log::error!("Failed to load model from {}: {}", path.display(), e);
            Arc::new(UnloadedClassifier::new(e.to_string()))
        }
    }
}

#[cfg(not(feature = "torch"))]
fn load_model(path: &Path) -> Arc<dyn Classifier> {
    log::warn!(
        "Built without the `torch` feature; the model at {} is not loaded",
        path.display()
    );
    Arc::new(UnloadedClassifier::new("built without model runtime support"))
}

/// Reads the eczema probability out of raw model outputs: a single sigmoid
/// output is taken as is, a pair of logits is soft-maxed and the second
/// (eczema) class taken.
pub fn probability_from_outputs(outputs: &[f32]) -> Result<f32, ClassifierError> {
    let probability = match outputs {
        [p] => *p,
        [normal, eczema] => {
            let max = normal.max(*eczema);
            let (en, ee) = ((normal - max).exp(), (eczema - max).exp());
            ee / (en + ee)
        }
        other => {
            return Err(ClassifierError::InferenceFailure(format!(
                "expected 1 or 2 outputs, got {}",
                other.len()
            )));
        }
    };
    validate_probability(probability)
}

pub fn validate_probability(probability: f32) -> Result<f32, ClassifierError> {
    if probability.is_finite() && (0.0..=1.0).contains(&probability) {
        Ok(probability)
    } else {
        Err(ClassifierError::InferenceFailure(format!(
            "model produced an invalid probability: {}",
            probability
        )))
    }
}
