use std::path::{Path, PathBuf};
use std::sync::Arc;

use shared::{AnalysisResponse, FULL_DISCLAIMER, PredictionState};
use thiserror::Error;

use crate::analysis::{
    Decision, Extraction, FeatureExtractor, FusionEngine, SeverityEstimator, UncertaintyDetector,
};
use crate::assessor::{AssessmentContext, ExternalAssessor};
use crate::classifier::{Classifier, ClassifierError};
use crate::config::ServiceConfig;
use crate::imaging::processor::{ImageProcessor, IntakeError};
use crate::imaging::relevance::RelevanceDetector;

const UNCERTAIN_MESSAGE: &str =
    "The image shows patterns that cannot be confidently classified as eczema or normal skin.";

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// Outcome of the blocking half of an analysis.
#[derive(Debug)]
pub enum Prepared {
    Irrelevant(AnalysisResponse),
    Local(LocalAnalysis),
}

#[derive(Debug)]
pub struct LocalAnalysis {
    pub probability: f32,
    pub extraction: Extraction,
    pub decision: Decision,
}

/// Owns every analysis service; built once at startup and shared read-only.
pub struct AnalysisPipeline {
    processor: ImageProcessor,
    relevance: RelevanceDetector,
    features: FeatureExtractor,
    uncertainty: UncertaintyDetector,
    fusion: FusionEngine,
    classifier: Arc<dyn Classifier>,
    assessor: Arc<dyn ExternalAssessor>,
    model_path: PathBuf,
}

impl AnalysisPipeline {
    pub fn new(
        config: &ServiceConfig,
        classifier: Arc<dyn Classifier>,
        assessor: Arc<dyn ExternalAssessor>,
    ) -> Self {
        Self {
            processor: ImageProcessor::new(config.image.clone()),
            relevance: RelevanceDetector::new(),
            features: FeatureExtractor::new(),
            uncertainty: UncertaintyDetector::new(config.uncertainty.clone()),
            fusion: FusionEngine::new(
                &config.uncertainty,
                config.fusion.clone(),
                SeverityEstimator::new(config.severity.clone()),
            ),
            classifier,
            assessor,
            model_path: config.model.path.clone(),
        }
    }

    pub fn is_model_loaded(&self) -> bool {
        self.classifier.is_loaded()
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.processor.max_bytes()
    }

    /// CPU-bound half: intake, relevance, inference, features and Stage A.
    pub fn prepare(&self, image_data: &[u8]) -> Result<Prepared, AnalysisError> {
        let fingerprint = ImageProcessor::fingerprint(image_data);
        let image = self.processor.process(image_data)?;

        let relevance = self.relevance.check(image.view());
        if !relevance.relevant {
            log::info!("[{}] Image rejected by relevance check", fingerprint);
            return Ok(Prepared::Irrelevant(AnalysisResponse::irrelevant(relevance.reason)));
        }

        let probability = self.classifier.predict(image.view())?;
        let extraction = self.features.extract(image.view());
        let verdict = self.uncertainty.evaluate_features(&extraction, probability);
        let decision = self.fusion.decide_local(probability, &verdict, &extraction);

        log::info!(
            "[{}] Local decision: probability {:.4}, band {}, state {}",
            fingerprint,
            probability,
            decision.band.as_str(),
            decision.state
        );
        Ok(Prepared::Local(LocalAnalysis {
            probability,
            extraction,
            decision,
        }))
    }

    /// Async half: external review, Stage B and the response.
    pub async fn complete(&self, image_data: &[u8], prepared: Prepared) -> AnalysisResponse {
        let local = match prepared {
            Prepared::Irrelevant(response) => return response,
            Prepared::Local(local) => local,
        };

        let context = AssessmentContext {
            probability: local.probability,
            state: local.decision.state,
            severity: local.decision.severity,
            uncertainty_reason: local.decision.uncertainty_reason.clone(),
        };
        let external = self.assessor.assess(image_data, &context).await;
        let decision = self.fusion.arbitrate(
            local.decision,
            local.probability,
            &external,
            &local.extraction,
        );

        AnalysisResponse {
            relevant: true,
            prediction: decision.state,
            eczema_detected: decision.eczema_detected(),
            confidence: decision.confidence,
            severity: decision.severity,
            explanation: Some(external.explanation),
            reasoning: Some(decision.reasoning()),
            message: (decision.state == PredictionState::Uncertain)
                .then(|| UNCERTAIN_MESSAGE.to_string()),
            disclaimer: FULL_DISCLAIMER.into(),
        }
    }

    /// Both halves on the current task.
    pub async fn analyze(&self, image_data: &[u8]) -> Result<AnalysisResponse, AnalysisError> {
        let prepared = self.prepare(image_data)?;
        Ok(self.complete(image_data, prepared).await)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use futures::future::{self, BoxFuture};
    use ndarray::ArrayView3;

    use crate::assessor::{AssessmentContext, ExternalAssessment, ExternalAssessor};
    use crate::classifier::{Classifier, ClassifierError};

    pub struct FixedClassifier(pub f32);

    impl Classifier for FixedClassifier {
        fn predict(&self, _image: ArrayView3<f32>) -> Result<f32, ClassifierError> {
            Ok(self.0)
        }

        fn is_loaded(&self) -> bool {
            true
        }
    }

    pub struct FixedAssessor(pub ExternalAssessment);

    impl ExternalAssessor for FixedAssessor {
        fn assess<'a>(
            &'a self,
            _image: &'a [u8],
            _context: &'a AssessmentContext,
        ) -> BoxFuture<'a, ExternalAssessment> {
            Box::pin(future::ready(self.0.clone()))
        }
    }
}
