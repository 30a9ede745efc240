pub mod features;
pub mod fusion;
pub mod severity;
pub mod uncertainty;

pub use features::{Extraction, FeatureExtractor, VisualFeatures};
pub use fusion::{Decision, DecisionRule, FusionEngine};
pub use severity::SeverityEstimator;
pub use uncertainty::{ConfidenceBand, UncertaintyDetector, UncertaintyVerdict};
