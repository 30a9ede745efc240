pub mod gemini;
mod parse;

use futures::future::{self, BoxFuture};
use shared::{PredictionState, SeverityLevel};

pub use gemini::GeminiAssessor;

/// What the external reviewer concluded about the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentVerdict {
    Positive,
    Negative,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalAssessment {
    pub verdict: AssessmentVerdict,
    pub confidence: Option<f32>,
    pub explanation: String,
}

impl ExternalAssessment {
    pub fn new(verdict: AssessmentVerdict, confidence: Option<f32>, explanation: String) -> Self {
        Self {
            verdict,
            confidence: confidence.map(|c| c.clamp(0.0, 1.0)),
            explanation,
        }
    }

    pub fn unresolved(explanation: String) -> Self {
        Self {
            verdict: AssessmentVerdict::Unresolved,
            confidence: None,
            explanation,
        }
    }

    /// A missing confidence never clears a bar.
    pub fn clears(&self, bar: f32) -> bool {
        self.confidence.is_some_and(|c| c >= bar)
    }
}

/// Local outcome handed to the reviewer so it can comment on it.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentContext {
    pub probability: f32,
    pub state: PredictionState,
    pub severity: Option<SeverityLevel>,
    pub uncertainty_reason: Option<String>,
}

/// Independent second opinion on an image. Implementations absorb their own
/// failures and answer `Unresolved` instead of erroring.
pub trait ExternalAssessor: Send + Sync {
    fn assess<'a>(
        &'a self,
        image: &'a [u8],
        context: &'a AssessmentContext,
    ) -> BoxFuture<'a, ExternalAssessment>;
}

/// Offline assessor: canned explanation, never a verdict.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedAssessor;

impl ExternalAssessor for RuleBasedAssessor {
    fn assess<'a>(
        &'a self,
        _image: &'a [u8],
        context: &'a AssessmentContext,
    ) -> BoxFuture<'a, ExternalAssessment> {
        Box::pin(future::ready(ExternalAssessment::unresolved(
            rule_based_explanation(context),
        )))
    }
}

pub fn rule_based_explanation(context: &AssessmentContext) -> String {
    let percent = (context.probability.clamp(0.0, 1.0) * 100.0) as u32;
    match (context.state, context.severity) {
        (PredictionState::Eczema, Some(SeverityLevel::Severe)) => format!(
            "The AI analysis indicates a high probability ({}%) of eczema patterns with severe \
             characteristics. The image shows significant redness and texture changes. This is \
             an AI assessment, not a medical diagnosis.",
            percent
        ),
        (PredictionState::Eczema, Some(SeverityLevel::Moderate)) => format!(
            "The AI analysis indicates a moderate probability ({}%) of eczema patterns. The image \
             shows moderate redness and texture irregularities consistent with eczema. This is an \
             AI assessment, not a medical diagnosis.",
            percent
        ),
        (PredictionState::Eczema, _) => format!(
            "The AI analysis indicates a moderate probability ({}%) of mild eczema patterns. The \
             image shows some characteristics that may resemble eczema. This is an AI \
             assessment, not a medical diagnosis.",
            percent
        ),
        (PredictionState::Normal, _) => format!(
            "The AI analysis shows a low probability ({}%) of eczema patterns. The image does not \
             show strong indicators of eczema. This is an AI assessment, not a medical diagnosis.",
            percent
        ),
        (PredictionState::Uncertain, _) => format!(
            "The AI analysis could not confidently classify this image (eczema probability {}%). \
             {} It may show a different skin condition, or the photo may be unclear. This is an \
             AI assessment, not a medical diagnosis.",
            percent,
            context
                .uncertainty_reason
                .as_deref()
                .unwrap_or("The visual patterns are ambiguous.")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(state: PredictionState, severity: Option<SeverityLevel>) -> AssessmentContext {
        AssessmentContext {
            probability: 0.876,
            state,
            severity,
            uncertainty_reason: None,
        }
    }

    #[test]
    fn confidence_is_clamped_and_required() {
        let a = ExternalAssessment::new(AssessmentVerdict::Positive, Some(1.4), String::new());
        assert_eq!(a.confidence, Some(1.0));
        assert!(a.clears(0.9));

        let missing = ExternalAssessment::new(AssessmentVerdict::Positive, None, String::new());
        assert!(!missing.clears(0.0));
    }

    #[test]
    fn explanations_follow_state_and_severity() {
        let severe = rule_based_explanation(&context(
            PredictionState::Eczema,
            Some(SeverityLevel::Severe),
        ));
        assert!(severe.contains("high probability (87%)"));
        assert!(severe.contains("severe characteristics"));

        let mild = rule_based_explanation(&context(PredictionState::Eczema, Some(SeverityLevel::Mild)));
        assert!(mild.contains("mild eczema patterns"));

        let normal = rule_based_explanation(&context(PredictionState::Normal, None));
        assert!(normal.contains("does not show strong indicators"));

        let mut uncertain = context(PredictionState::Uncertain, None);
        uncertain.uncertainty_reason = Some("Patterns are unusual.".into());
        assert!(rule_based_explanation(&uncertain).contains("Patterns are unusual."));
    }

    #[actix_web::test]
    async fn rule_based_assessor_never_resolves() {
        let ctx = context(PredictionState::Eczema, Some(SeverityLevel::Moderate));
        let outcome = RuleBasedAssessor.assess(&[], &ctx).await;
        assert_eq!(outcome.verdict, AssessmentVerdict::Unresolved);
        assert_eq!(outcome.confidence, None);
        assert_eq!(outcome.explanation, rule_based_explanation(&ctx));
    }
}
