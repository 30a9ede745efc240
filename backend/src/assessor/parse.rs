use serde::Deserialize;

use super::{AssessmentVerdict, ExternalAssessment};

const ASSESSMENT_KEY: &str = "\"gemini_assessment\"";
const POSITIVE_KEYWORDS: [&str; 7] = [
    "eczema",
    "redness",
    "inflammation",
    "irritation",
    "see signs",
    "detect",
    "present",
];
const NEGATIONS: [&str; 2] = ["no eczema", "not see"];
const INFERRED_CONFIDENCE: f32 = 0.7;

#[derive(Debug, Deserialize)]
struct VisionReply {
    gemini_assessment: Option<bool>,
    gemini_confidence: Option<f32>,
    explanation: Option<String>,
}

/// Interprets the reviewer's free-text reply to the vision prompt.
pub(crate) fn parse_vision_reply(text: &str) -> ExternalAssessment {
    let text = text.trim();
    if let Some(reply) = assessment_object(text).and_then(|o| serde_json::from_str::<VisionReply>(o).ok()) {
        let verdict = match reply.gemini_assessment {
            Some(true) => AssessmentVerdict::Positive,
            Some(false) => AssessmentVerdict::Negative,
            None => AssessmentVerdict::Unresolved,
        };
        let explanation = reply.explanation.unwrap_or_else(|| text.to_string());
        return ExternalAssessment::new(verdict, reply.gemini_confidence, explanation);
    }
    infer_from_text(text)
}

/// First brace-free `{...}` enclosing a mention of the assessment key.
fn assessment_object(text: &str) -> Option<&str> {
    text.match_indices(ASSESSMENT_KEY)
        .find_map(|(key, _)| enclosing_object(text, key))
}

fn enclosing_object(text: &str, key: usize) -> Option<&str> {
    let start = text[..key].rfind(['{', '}'])?;
    if text.as_bytes()[start] != b'{' {
        return None;
    }
    let after = key + ASSESSMENT_KEY.len();
    let end = after + text[after..].find(['{', '}'])?;
    if text.as_bytes()[end] != b'}' {
        return None;
    }
    Some(&text[start..=end])
}

fn infer_from_text(text: &str) -> ExternalAssessment {
    let lower = text.to_lowercase();
    let mentions = POSITIVE_KEYWORDS.iter().any(|k| lower.contains(k));
    let negated = NEGATIONS.iter().any(|n| lower.contains(n));
    if mentions && !negated {
        ExternalAssessment::new(
            AssessmentVerdict::Positive,
            Some(INFERRED_CONFIDENCE),
            text.to_string(),
        )
    } else {
        ExternalAssessment::unresolved(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let reply = "Here is my analysis:\n```json\n{\n  \"gemini_assessment\": false,\n  \
                     \"gemini_confidence\": 0.92,\n  \"explanation\": \"Healthy skin.\"\n}\n```";
        let a = parse_vision_reply(reply);
        assert_eq!(a.verdict, AssessmentVerdict::Negative);
        assert_eq!(a.confidence, Some(0.92));
        assert_eq!(a.explanation, "Healthy skin.");
    }

    #[test]
    fn null_assessment_is_unresolved() {
        let a = parse_vision_reply(r#"{"gemini_assessment": null, "gemini_confidence": 0.4, "explanation": "Blurry."}"#);
        assert_eq!(a.verdict, AssessmentVerdict::Unresolved);
        assert_eq!(a.explanation, "Blurry.");
    }

    #[test]
    fn missing_explanation_keeps_reply_text() {
        let reply = r#"{"gemini_assessment": true, "gemini_confidence": 1.5}"#;
        let a = parse_vision_reply(reply);
        assert_eq!(a.verdict, AssessmentVerdict::Positive);
        assert_eq!(a.confidence, Some(1.0));
        assert_eq!(a.explanation, reply);
    }

    #[test]
    fn nested_braces_are_not_an_assessment() {
        let reply = r#"{"outer": {"x": 1}, "gemini_assessment": true, "inner": {"y": 2}}"#;
        assert_eq!(assessment_object(reply), None);
    }

    #[test]
    fn echoed_key_before_the_object_is_skipped() {
        let reply = "Checking the \"gemini_assessment\" field as requested:\n\
                     {\"gemini_assessment\": false, \"gemini_confidence\": 0.95, \
                     \"explanation\": \"Even tone, no lesions.\"}";
        let a = parse_vision_reply(reply);
        assert_eq!(a.verdict, AssessmentVerdict::Negative);
        assert_eq!(a.confidence, Some(0.95));
        assert_eq!(a.explanation, "Even tone, no lesions.");
    }

    #[test]
    fn later_object_is_found_after_a_nested_one() {
        let reply = r#"{"meta": {"v": 1}, "gemini_assessment": true} then {"gemini_assessment": true, "gemini_confidence": 0.8}"#;
        assert_eq!(
            assessment_object(reply),
            Some(r#"{"gemini_assessment": true, "gemini_confidence": 0.8}"#)
        );
    }

    #[test]
    fn malformed_json_falls_back_to_keywords() {
        let reply = "{\"gemini_assessment\": true, // I see eczema\n}";
        let a = parse_vision_reply(reply);
        assert_eq!(a.verdict, AssessmentVerdict::Positive);
        assert_eq!(a.confidence, Some(0.7));
        assert_eq!(a.explanation, reply);
    }

    #[test]
    fn keyword_inference() {
        let positive = parse_vision_reply("I can see signs of redness and inflammation on the arm.");
        assert_eq!(positive.verdict, AssessmentVerdict::Positive);

        let negated = parse_vision_reply("There is no eczema visible, only mild redness.");
        assert_eq!(negated.verdict, AssessmentVerdict::Unresolved);
        assert_eq!(negated.confidence, None);

        let silent = parse_vision_reply("The skin looks smooth and even.");
        assert_eq!(silent.verdict, AssessmentVerdict::Unresolved);
    }
}
