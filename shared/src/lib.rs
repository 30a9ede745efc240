use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub const SHORT_DISCLAIMER: &str = "This is an AI-based assessment and not a medical diagnosis.";
pub const FULL_DISCLAIMER: &str = "This is an AI-based assessment and not a medical diagnosis. \
Please consult a healthcare professional for proper medical advice.";

/// Final, mutually exclusive outcome of an analysis.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum PredictionState {
    Eczema,
    Normal,
    Uncertain,
}

/// Only ever reported alongside `PredictionState::Eczema`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
pub enum SeverityLevel {
    Mild,
    Moderate,
    Severe,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnalysisResponse {
    pub relevant: bool,
    pub prediction: PredictionState,
    pub eczema_detected: bool,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub severity: Option<SeverityLevel>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    pub disclaimer: String,
}

impl AnalysisResponse {
    /// Response for an image that did not pass the skin relevance check.
    pub fn irrelevant(reason: impl Into<String>) -> Self {
        Self {
            relevant: false,
            prediction: PredictionState::Normal,
            eczema_detected: false,
            confidence: 0.0,
            severity: None,
            explanation: None,
            reasoning: Some("Image does not appear to contain human skin.".into()),
            message: Some(reason.into()),
            disclaimer: SHORT_DISCLAIMER.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}
