//! Three-state decision over the model probability, the uncertainty verdict
//! and an optional external assessment.
//!
//! Stage A decides from local evidence only. Stage B arbitrates that outcome
//! against the external reviewer, which is handed the Stage A state first.

use shared::{PredictionState, SeverityLevel};

use crate::analysis::features::Extraction;
use crate::analysis::severity::SeverityEstimator;
use crate::analysis::uncertainty::{ConfidenceBand, UncertaintyVerdict};
use crate::assessor::{AssessmentVerdict, ExternalAssessment};
use crate::config::{FusionConfig, UncertaintyConfig};

const AMBIGUOUS_RANGE_REASON: &str =
    "Confidence falls in ambiguous range between high and low thresholds.";
const BORDERLINE_REASON: &str =
    "Borderline probability with no independent assessment to confirm normal skin.";
const NEUTRAL_CONFIDENCE: f32 = 0.5;

/// The rule that fixed the final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionRule {
    UncertaintyDetected,
    HighConfidenceEczema,
    HighConfidenceNormal,
    AmbiguousRange,
    ExternalNegativeOverride,
    ExternalPositiveOverride,
    ExternalResolvedEczema,
    ExternalResolvedNormal,
    BorderlineFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub state: PredictionState,
    pub confidence: f32,
    pub severity: Option<SeverityLevel>,
    pub rule: DecisionRule,
    /// Band of the local probability, kept through arbitration.
    pub band: ConfidenceBand,
    pub uncertainty_reason: Option<String>,
}

impl Decision {
    fn eczema(confidence: f32, severity: SeverityLevel, rule: DecisionRule, band: ConfidenceBand) -> Self {
        Self {
            state: PredictionState::Eczema,
            confidence,
            severity: Some(severity),
            rule,
            band,
            uncertainty_reason: None,
        }
    }

    fn normal(confidence: f32, rule: DecisionRule, band: ConfidenceBand) -> Self {
        Self {
            state: PredictionState::Normal,
            confidence,
            severity: None,
            rule,
            band,
            uncertainty_reason: None,
        }
    }

    fn uncertain(confidence: f32, reason: String, rule: DecisionRule, band: ConfidenceBand) -> Self {
        Self {
            state: PredictionState::Uncertain,
            confidence,
            severity: None,
            rule,
            band,
            uncertainty_reason: Some(reason),
        }
    }

    pub fn eczema_detected(&self) -> bool {
        self.state == PredictionState::Eczema
    }

    /// Audit line: band of the local probability, then the dominant cause.
    pub fn reasoning(&self) -> String {
        let percent = (self.confidence * 100.0).round() as u32;
        let cause = match self.rule {
            DecisionRule::UncertaintyDetected
            | DecisionRule::AmbiguousRange
            | DecisionRule::BorderlineFallback => format!(
                "Uncertainty detected: {}",
                self.uncertainty_reason
                    .as_deref()
                    .unwrap_or(AMBIGUOUS_RANGE_REASON)
            ),
            DecisionRule::HighConfidenceEczema => {
                format!("High confidence eczema detection ({}%).", percent)
            }
            DecisionRule::HighConfidenceNormal => {
                format!("High confidence no eczema ({}%).", percent)
            }
            DecisionRule::ExternalNegativeOverride => format!(
                "Vision assessment overrode the model: no eczema ({}%).",
                percent
            ),
            DecisionRule::ExternalPositiveOverride => format!(
                "Vision assessment overrode the model: eczema detected ({}%).",
                percent
            ),
            DecisionRule::ExternalResolvedEczema => format!(
                "Vision assessment resolved the uncertainty: eczema detected ({}%).",
                percent
            ),
            DecisionRule::ExternalResolvedNormal => format!(
                "Vision assessment resolved the uncertainty: no eczema ({}%).",
                percent
            ),
        };
        format!("Confidence band: {}. {}", self.band.as_str(), cause)
    }
}

#[derive(Debug, Clone)]
pub struct FusionEngine {
    high_threshold: f32,
    low_threshold: f32,
    config: FusionConfig,
    severity: SeverityEstimator,
}

impl FusionEngine {
    pub fn new(
        uncertainty: &UncertaintyConfig,
        config: FusionConfig,
        severity: SeverityEstimator,
    ) -> Self {
        Self {
            high_threshold: uncertainty.high_confidence_threshold,
            low_threshold: uncertainty.low_confidence_threshold,
            config,
            severity,
        }
    }

    /// Stage A. `extraction` feeds severity when the state is Eczema.
    pub fn decide_local(
        &self,
        probability: f32,
        verdict: &UncertaintyVerdict,
        extraction: &Extraction,
    ) -> Decision {
        let band = ConfidenceBand::of(probability, self.high_threshold, self.low_threshold);

        if verdict.is_uncertain {
            Decision::uncertain(
                verdict.adjusted_confidence,
                verdict.reason.clone(),
                DecisionRule::UncertaintyDetected,
                band,
            )
        } else if probability >= self.high_threshold {
            let severity = self.severity.estimate_features(extraction, probability);
            Decision::eczema(probability, severity, DecisionRule::HighConfidenceEczema, band)
        } else if probability <= self.low_threshold {
            Decision::normal(1.0 - probability, DecisionRule::HighConfidenceNormal, band)
        } else {
            Decision::uncertain(
                NEUTRAL_CONFIDENCE,
                AMBIGUOUS_RANGE_REASON.into(),
                DecisionRule::AmbiguousRange,
                band,
            )
        }
    }

    /// Stage B. Returns the final decision with confidence rounded to 2 decimals.
    pub fn arbitrate(
        &self,
        local: Decision,
        probability: f32,
        external: &ExternalAssessment,
        extraction: &Extraction,
    ) -> Decision {
        let band = local.band;
        let cfg = &self.config;

        let mut decision = match (local.state, external.verdict, external.confidence) {
            (PredictionState::Eczema, AssessmentVerdict::Negative, Some(c))
                if external.clears(cfg.negative_override_confidence) =>
            {
                Decision::normal(c, DecisionRule::ExternalNegativeOverride, band)
            }
            (PredictionState::Normal, AssessmentVerdict::Positive, Some(c))
                if (external.clears(cfg.positive_override_confidence)
                    && probability >= cfg.positive_override_min_probability)
                    || external.clears(cfg.positive_unconditional_confidence) =>
            {
                let severity = self.severity.estimate_features(extraction, c);
                Decision::eczema(c, severity, DecisionRule::ExternalPositiveOverride, band)
            }
            (PredictionState::Uncertain, AssessmentVerdict::Positive, Some(c))
                if external.clears(cfg.uncertain_positive_confidence) =>
            {
                let severity = self.severity.estimate_features(extraction, c);
                Decision::eczema(c, severity, DecisionRule::ExternalResolvedEczema, band)
            }
            (PredictionState::Uncertain, AssessmentVerdict::Negative, Some(c))
                if external.clears(cfg.uncertain_negative_confidence) =>
            {
                Decision::normal(c, DecisionRule::ExternalResolvedNormal, band)
            }
            (PredictionState::Normal, AssessmentVerdict::Unresolved, _)
                if (cfg.borderline_lower..cfg.borderline_upper).contains(&probability) =>
            {
                Decision::uncertain(
                    NEUTRAL_CONFIDENCE,
                    BORDERLINE_REASON.into(),
                    DecisionRule::BorderlineFallback,
                    band,
                )
            }
            _ => local,
        };

        decision.confidence = round2(decision.confidence);
        log::debug!(
            "Fusion: probability {:.4}, external {:?} {:?}, rule {:?}, state {}, confidence {:.2}",
            probability,
            external.verdict,
            external.confidence,
            decision.rule,
            decision.state,
            decision.confidence
        );
        decision
    }

    pub fn decide(
        &self,
        probability: f32,
        verdict: &UncertaintyVerdict,
        extraction: &Extraction,
        external: &ExternalAssessment,
    ) -> Decision {
        let local = self.decide_local(probability, verdict, extraction);
        self.arbitrate(local, probability, external, extraction)
    }
}

/// Ties go to the even hundredth.
fn round2(value: f32) -> f32 {
    (value * 100.0).round_ties_even() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::features::{FeatureError, VisualFeatures};
    use crate::analysis::uncertainty::UncertaintyDetector;
    use crate::config::SeverityConfig;
    use crate::imaging::color::LayoutError;
    use approx::assert_relative_eq;

    fn engine() -> FusionEngine {
        FusionEngine::new(
            &UncertaintyConfig::default(),
            FusionConfig::default(),
            SeverityEstimator::new(SeverityConfig::default()),
        )
    }

    fn features() -> Extraction {
        Ok(VisualFeatures::new(0.2, 0.2, 500.0, 0.3))
    }

    fn verdict_for(config: UncertaintyConfig, probability: f32) -> UncertaintyVerdict {
        UncertaintyDetector::new(config).evaluate_features(&features(), probability)
    }

    fn verdict(probability: f32) -> UncertaintyVerdict {
        verdict_for(UncertaintyConfig::default(), probability)
    }

    fn unresolved() -> ExternalAssessment {
        ExternalAssessment::unresolved("offline".into())
    }

    fn external(verdict: AssessmentVerdict, confidence: f32) -> ExternalAssessment {
        ExternalAssessment::new(verdict, Some(confidence), "reviewed".into())
    }

    #[test]
    fn confident_model_without_reviewer_is_eczema() {
        let d = engine().decide(0.876, &verdict(0.876), &features(), &unresolved());
        assert_eq!(d.state, PredictionState::Eczema);
        assert!(d.eczema_detected());
        assert_relative_eq!(d.confidence, 0.88);
        assert_eq!(d.rule, DecisionRule::HighConfidenceEczema);
        assert!(d.severity.is_some());
        assert_eq!(
            d.reasoning(),
            "Confidence band: high. High confidence eczema detection (88%)."
        );
    }

    #[test]
    fn low_probability_outside_borderline_is_normal() {
        let d = engine().decide(0.123, &verdict(0.123), &features(), &unresolved());
        assert_eq!(d.state, PredictionState::Normal);
        assert!(!d.eczema_detected());
        assert_relative_eq!(d.confidence, 0.88);
        assert_eq!(d.severity, None);
        assert_eq!(d.rule, DecisionRule::HighConfidenceNormal);
    }

    #[test]
    fn borderline_normal_without_reviewer_is_uncertain() {
        let d = engine().decide(0.30, &verdict(0.30), &features(), &unresolved());
        assert_eq!(d.state, PredictionState::Uncertain);
        assert_relative_eq!(d.confidence, 0.5);
        assert_eq!(d.rule, DecisionRule::BorderlineFallback);
        assert!(d.reasoning().starts_with("Confidence band: low. Uncertainty detected: Borderline"));

        // the upper edge of the borderline window is open
        let edge = engine().decide(0.40, &verdict(0.40), &features(), &unresolved());
        assert_eq!(edge.state, PredictionState::Normal);
        let lower = engine().decide(0.20, &verdict(0.20), &features(), &unresolved());
        assert_eq!(lower.state, PredictionState::Uncertain);
    }

    #[test]
    fn borderline_fallback_needs_an_unresolved_reviewer() {
        let e = engine();
        let v = verdict(0.30);
        assert!(!v.is_uncertain);

        for ext in [
            external(AssessmentVerdict::Positive, 0.60),
            external(AssessmentVerdict::Negative, 0.95),
        ] {
            let d = e.decide(0.30, &v, &features(), &ext);
            assert_eq!(d.state, PredictionState::Normal);
            assert_eq!(d.rule, DecisionRule::HighConfidenceNormal);
            assert_relative_eq!(d.confidence, 0.70);
        }

        let flipped = e.decide(0.30, &v, &features(), &external(AssessmentVerdict::Positive, 0.75));
        assert_eq!(flipped.state, PredictionState::Eczema);
        assert_eq!(flipped.rule, DecisionRule::ExternalPositiveOverride);
    }

    #[test]
    fn negative_override_needs_ninety_percent() {
        let e = engine();
        let v = verdict(0.62);
        let kept = e.decide(0.62, &v, &features(), &external(AssessmentVerdict::Negative, 0.89));
        assert_eq!(kept.state, PredictionState::Eczema);
        assert_relative_eq!(kept.confidence, 0.62);

        let flipped = e.decide(0.62, &v, &features(), &external(AssessmentVerdict::Negative, 0.90));
        assert_eq!(flipped.state, PredictionState::Normal);
        assert_relative_eq!(flipped.confidence, 0.90);
        assert_eq!(flipped.severity, None);
        assert_eq!(flipped.rule, DecisionRule::ExternalNegativeOverride);
        assert_eq!(flipped.band, ConfidenceBand::High);
    }

    #[test]
    fn positive_override_of_normal() {
        let e = engine();
        let v = verdict(0.1);
        // 0.75 with a non-trivial local probability
        let flipped = e.decide(0.16, &verdict(0.16), &features(), &external(AssessmentVerdict::Positive, 0.75));
        assert_eq!(flipped.state, PredictionState::Eczema);
        assert_eq!(flipped.rule, DecisionRule::ExternalPositiveOverride);
        assert_relative_eq!(flipped.confidence, 0.75);
        assert!(flipped.severity.is_some());

        // 0.75 is not enough when the model is nearly certain it's normal
        let kept = e.decide(0.1, &v, &features(), &external(AssessmentVerdict::Positive, 0.75));
        assert_eq!(kept.state, PredictionState::Normal);

        // 0.80 overrides regardless
        let forced = e.decide(0.1, &v, &features(), &external(AssessmentVerdict::Positive, 0.80));
        assert_eq!(forced.state, PredictionState::Eczema);
    }

    #[test]
    fn override_severity_uses_external_confidence() {
        let e = engine();
        let extraction = features();
        let d = e.decide(0.1, &verdict(0.1), &extraction, &external(AssessmentVerdict::Positive, 0.95));
        let expected = SeverityEstimator::new(SeverityConfig::default()).estimate_features(&extraction, 0.95);
        assert_eq!(d.severity, Some(expected));
    }

    #[test]
    fn reviewer_resolves_uncertain() {
        let e = engine();
        let v = verdict(0.5);
        assert!(v.is_uncertain);

        let eczema = e.decide(0.5, &v, &features(), &external(AssessmentVerdict::Positive, 0.65));
        assert_eq!(eczema.state, PredictionState::Eczema);
        assert_eq!(eczema.rule, DecisionRule::ExternalResolvedEczema);

        let weak = e.decide(0.5, &v, &features(), &external(AssessmentVerdict::Positive, 0.64));
        assert_eq!(weak.state, PredictionState::Uncertain);

        let normal = e.decide(0.5, &v, &features(), &external(AssessmentVerdict::Negative, 0.70));
        assert_eq!(normal.state, PredictionState::Normal);
        assert_eq!(normal.rule, DecisionRule::ExternalResolvedNormal);
        assert_eq!(
            normal.reasoning(),
            "Confidence band: medium. Vision assessment resolved the uncertainty: no eczema (70%)."
        );

        let still = e.decide(0.5, &v, &features(), &external(AssessmentVerdict::Negative, 0.69));
        assert_eq!(still.state, PredictionState::Uncertain);
    }

    #[test]
    fn missing_external_confidence_never_clears() {
        let e = engine();
        let positive = ExternalAssessment::new(AssessmentVerdict::Positive, None, String::new());
        let d = e.decide(0.1, &verdict(0.1), &features(), &positive);
        assert_eq!(d.state, PredictionState::Normal);

        let negative = ExternalAssessment::new(AssessmentVerdict::Negative, None, String::new());
        let d = e.decide(0.9, &verdict(0.9), &features(), &negative);
        assert_eq!(d.state, PredictionState::Eczema);
    }

    #[test]
    fn both_ambiguous_paths_end_uncertain() {
        let e = engine();
        let detected = e.decide(0.5, &verdict(0.5), &features(), &unresolved());
        assert_eq!(detected.state, PredictionState::Uncertain);
        assert_eq!(detected.rule, DecisionRule::UncertaintyDetected);
        assert_relative_eq!(detected.confidence, 0.5);

        let strict = UncertaintyConfig {
            min_uncertainty_factors: 3,
            ..UncertaintyConfig::default()
        };
        let residual_verdict = verdict_for(strict, 0.5);
        assert!(!residual_verdict.is_uncertain);
        let residual = e.decide(0.5, &residual_verdict, &features(), &unresolved());
        assert_eq!(residual.state, PredictionState::Uncertain);
        assert_eq!(residual.rule, DecisionRule::AmbiguousRange);
        assert_relative_eq!(residual.confidence, 0.5);
        assert_eq!(
            residual.reasoning(),
            "Confidence band: medium. Uncertainty detected: Confidence falls in ambiguous range \
             between high and low thresholds."
        );
    }

    #[test]
    fn failed_extraction_routes_to_uncertain() {
        let failed: Extraction = Err(FeatureError::Layout(LayoutError::Empty));
        let v = UncertaintyDetector::new(UncertaintyConfig::default()).evaluate_features(&failed, 0.95);
        let d = engine().decide(0.95, &v, &failed, &unresolved());
        assert_eq!(d.state, PredictionState::Uncertain);
        assert_eq!(d.rule, DecisionRule::UncertaintyDetected);
        assert!(d.reasoning().contains("Uncertainty analysis error"));
    }

    #[test]
    fn decisions_are_idempotent() {
        let e = engine();
        for p in [0.05, 0.25, 0.45, 0.5, 0.62, 0.99] {
            let v = verdict(p);
            let ext = external(AssessmentVerdict::Negative, 0.95);
            assert_eq!(
                e.decide(p, &v, &features(), &ext),
                e.decide(p, &v, &features(), &ext)
            );
        }
    }

    #[test]
    fn rounding_is_two_decimals() {
        assert_relative_eq!(round2(0.876), 0.88);
        assert_relative_eq!(round2(0.5), 0.5);
        assert_relative_eq!(round2(0.004), 0.0);
        assert_relative_eq!(round2(0.125), 0.12);
        assert_relative_eq!(round2(0.375), 0.38);
    }
}
