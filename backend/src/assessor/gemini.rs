use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::BoxFuture;
use rand::Rng;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use shared::PredictionState;
use thiserror::Error;
use url::Url;

use super::parse::parse_vision_reply;
use super::{AssessmentContext, ExternalAssessment, ExternalAssessor, rule_based_explanation};
use crate::config::AssessorConfig;

const API_KEY_HEADER: &str = "x-goog-api-key";
const DEFAULT_MIME: &str = "image/jpeg";
const TEMPERATURE: f32 = 0.7;
const VISION_MAX_TOKENS: u32 = 300;
const TEXT_MAX_TOKENS: u32 = 200;

#[derive(Error, Debug)]
pub enum AssessorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
    #[error("Gemini API HTTP error: {status} - {message}")]
    Status { status: u16, message: String },
    #[error("Unexpected API response format")]
    Format,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    Image { inline_data: InlineData },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl GenerateResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
            .map(|t| t.trim().to_string())
    }
}

/// Second opinion from Google's Generative Language API.
#[derive(Clone)]
pub struct GeminiAssessor {
    http_client: HttpClient,
    endpoint: Url,
    config: AssessorConfig,
}

impl GeminiAssessor {
    pub fn new(config: AssessorConfig) -> Result<Self, AssessorError> {
        let endpoint = Url::parse(&format!(
            "{}/models/{}:generateContent",
            config.base_url.trim_end_matches('/'),
            config.model
        ))?;
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http_client,
            endpoint,
            config,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn assess_with_key(
        &self,
        api_key: &str,
        image: &[u8],
        context: &AssessmentContext,
    ) -> ExternalAssessment {
        match self.vision(api_key, image, context).await {
            Ok(assessment) => return assessment,
            Err(e) => log::warn!("Gemini vision call failed, retrying text-only: {}", e),
        }
        match self.text_only(api_key, context).await {
            Ok(explanation) => ExternalAssessment::unresolved(explanation),
            Err(e) => {
                log::warn!("Gemini text call failed, using rule-based explanation: {}", e);
                ExternalAssessment::unresolved(rule_based_explanation(context))
            }
        }
    }

    async fn vision(
        &self,
        api_key: &str,
        image: &[u8],
        context: &AssessmentContext,
    ) -> Result<ExternalAssessment, AssessorError> {
        let prompt = vision_prompt(context);
        let request = GenerateRequest {
            contents: [Content {
                parts: vec![
                    Part::Text { text: &prompt },
                    Part::Image {
                        inline_data: InlineData {
                            mime_type: mime_type(image),
                            data: STANDARD.encode(image),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: VISION_MAX_TOKENS,
            },
        };
        let reply = self.generate(api_key, &request).await?;
        Ok(parse_vision_reply(&reply))
    }

    async fn text_only(&self, api_key: &str, context: &AssessmentContext) -> Result<String, AssessorError> {
        let prompt = text_prompt(context);
        let request = GenerateRequest {
            contents: [Content {
                parts: vec![Part::Text { text: &prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: TEXT_MAX_TOKENS,
            },
        };
        self.generate(api_key, &request).await
    }

    /// Posts one request, retrying with backoff while the service reports overload.
    async fn generate(&self, api_key: &str, request: &GenerateRequest<'_>) -> Result<String, AssessorError> {
        let mut attempt = 0;
        loop {
            let response = self
                .http_client
                .post(self.endpoint.clone())
                .header(API_KEY_HEADER, api_key)
                .json(request)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                let body: GenerateResponse = response.json().await?;
                return body.first_text().ok_or(AssessorError::Format);
            }

            if is_transient(status) && attempt < self.config.max_retries {
                let delay = backoff_delay(self.config.backoff_base_ms, attempt);
                log::warn!(
                    "Gemini API returned {}, retrying in {} ms (attempt {}/{})",
                    status.as_u16(),
                    delay.as_millis(),
                    attempt + 1,
                    self.config.max_retries
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            return Err(AssessorError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
    }
}

impl ExternalAssessor for GeminiAssessor {
    fn assess<'a>(
        &'a self,
        image: &'a [u8],
        context: &'a AssessmentContext,
    ) -> BoxFuture<'a, ExternalAssessment> {
        Box::pin(async move {
            match self.config.api_key.as_deref() {
                Some(api_key) => self.assess_with_key(api_key, image, context).await,
                None => ExternalAssessment::unresolved(rule_based_explanation(context)),
            }
        })
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

/// `base * 2^attempt` plus up to a quarter of `base` in jitter.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponential = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = rand::rng().random_range(0..=base_ms / 4);
    Duration::from_millis(exponential.saturating_add(jitter))
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) if body.is_empty() => "Unknown error".to_string(),
        Err(_) => body.chars().take(200).collect(),
    }
}

fn mime_type(image: &[u8]) -> &'static str {
    image::guess_format(image)
        .map(|format| format.to_mime_type())
        .unwrap_or(DEFAULT_MIME)
}

fn percent(probability: f32) -> u32 {
    (probability.clamp(0.0, 1.0) * 100.0) as u32
}

fn vision_prompt(context: &AssessmentContext) -> String {
    let result = match context.state {
        PredictionState::Eczema => "Eczema detected",
        PredictionState::Normal => "No eczema detected",
        PredictionState::Uncertain => "Uncertain, could not classify confidently",
    };
    let mut details = String::new();
    if let Some(severity) = context.severity {
        details.push_str(&format!("- Severity: {}\n", severity));
    }
    if let Some(reason) = &context.uncertainty_reason {
        details.push_str(&format!("- Uncertainty: {}\n", reason));
    }
    format!(
        "You are analyzing a skin image for eczema detection.\n\n\
         A custom trained AI model has analyzed this image and provided:\n\
         - Eczema probability: {}%\n\
         - Detection result: {}\n\
         {}\n\
         CRITICAL: The custom model may have errors. Please:\n\
         1. Analyze the image yourself carefully\n\
         2. Look for signs of eczema: redness, inflammation, scaling, dryness, patches, irritation\n\
         3. Provide your own assessment\n\n\
         Respond in this EXACT JSON format:\n\
         {{\n  \"gemini_assessment\": true or false,\n  \"gemini_confidence\": a number from 0.0 to 1.0,\n  \
         \"explanation\": \"3-4 sentences describing what you see, comparing with the model, \
         emphasizing this is NOT a diagnosis\"\n}}\n\n\
         Be honest and accurate. If you see clear eczema signs that the model missed, say so.",
        percent(context.probability),
        result,
        details
    )
}

fn text_prompt(context: &AssessmentContext) -> String {
    let findings = match (context.state, context.severity) {
        (PredictionState::Eczema, Some(severity)) => format!("- Severity level: {}", severity),
        (PredictionState::Eczema, None) => "- Result: Eczema patterns detected".to_string(),
        (PredictionState::Normal, _) => "- Result: No strong eczema patterns detected".to_string(),
        (PredictionState::Uncertain, _) => format!(
            "- Result: Could not be classified confidently ({})",
            context
                .uncertainty_reason
                .as_deref()
                .unwrap_or("ambiguous patterns")
        ),
    };
    format!(
        "You are a helpful AI assistant explaining skin analysis results.\n\n\
         The AI model analyzed a skin image and found:\n\
         - Eczema probability: {}%\n\
         {}\n\n\
         Generate a brief, user-friendly explanation (2-3 sentences) that:\n\
         1. Explains the result in simple terms\n\
         2. Mentions the confidence level appropriately\n\
         3. Emphasizes this is NOT a medical diagnosis\n\
         4. Avoids giving medical advice\n\n\
         Keep it professional, empathetic, and clear.",
        percent(context.probability),
        findings
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessor::AssessmentVerdict;
    use crate::imaging::test_support::{encode_png, skin_image};
    use actix_web::{App, HttpResponse, HttpServer, web};
    use shared::SeverityLevel;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Script {
        replies: Mutex<VecDeque<(u16, String)>>,
        requests: Mutex<Vec<serde_json::Value>>,
    }

    async fn scripted(script: web::Data<Script>, body: web::Json<serde_json::Value>) -> HttpResponse {
        script.requests.lock().unwrap().push(body.into_inner());
        let (status, body) = script
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((500, String::new()));
        HttpResponse::build(actix_web::http::StatusCode::from_u16(status).unwrap())
            .content_type("application/json")
            .body(body)
    }

    /// Serves the scripted replies in order on a local port.
    fn serve(replies: Vec<(u16, String)>) -> (web::Data<Script>, String) {
        let script = web::Data::new(Script {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        });
        let data = script.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/models/{model}", web::post().to(scripted))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let base_url = format!("http://{}", server.addrs()[0]);
        actix_web::rt::spawn(server.run());
        (script, base_url)
    }

    fn reply(text: &str) -> (u16, String) {
        let body = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        });
        (200, body.to_string())
    }

    fn assessor(base_url: String, api_key: Option<&str>) -> GeminiAssessor {
        GeminiAssessor::new(AssessorConfig {
            api_key: api_key.map(String::from),
            base_url,
            backoff_base_ms: 1,
            ..AssessorConfig::default()
        })
        .unwrap()
    }

    fn context() -> AssessmentContext {
        AssessmentContext {
            probability: 0.82,
            state: PredictionState::Eczema,
            severity: Some(SeverityLevel::Moderate),
            uncertainty_reason: None,
        }
    }

    #[actix_web::test]
    async fn missing_key_uses_rule_based_explanation() {
        let a = assessor("http://127.0.0.1:9".into(), None);
        assert!(!a.has_credentials());
        let outcome = a.assess(&[], &context()).await;
        assert_eq!(outcome, ExternalAssessment::unresolved(rule_based_explanation(&context())));
    }

    #[actix_web::test]
    async fn vision_reply_is_parsed() {
        let (script, base_url) = serve(vec![reply(
            r#"{"gemini_assessment": true, "gemini_confidence": 0.85, "explanation": "Red, scaly patches."}"#,
        )]);
        let image = encode_png(&skin_image(8));
        let outcome = assessor(base_url, Some("key")).assess(&image, &context()).await;
        assert_eq!(outcome.verdict, AssessmentVerdict::Positive);
        assert_eq!(outcome.confidence, Some(0.85));
        assert_eq!(outcome.explanation, "Red, scaly patches.");

        let requests = script.requests.lock().unwrap();
        let parts = &requests[0]["contents"][0]["parts"];
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(requests[0]["generationConfig"]["maxOutputTokens"], 300);
        assert!(parts[0]["text"].as_str().unwrap().contains("Eczema probability: 82%"));
    }

    #[actix_web::test]
    async fn overload_is_retried() {
        let (script, base_url) = serve(vec![
            (429, String::new()),
            (503, String::new()),
            reply(r#"{"gemini_assessment": false, "gemini_confidence": 0.9, "explanation": "Clear."}"#),
        ]);
        let outcome = assessor(base_url, Some("key")).assess(&[1, 2, 3], &context()).await;
        assert_eq!(outcome.verdict, AssessmentVerdict::Negative);
        assert_eq!(script.requests.lock().unwrap().len(), 3);
    }

    #[actix_web::test]
    async fn vision_failure_falls_back_to_text() {
        let (script, base_url) = serve(vec![
            (400, r#"{"error": {"message": "Image input not supported"}}"#.into()),
            reply("Your skin shows moderate eczema patterns."),
        ]);
        let outcome = assessor(base_url, Some("key")).assess(&[1, 2, 3], &context()).await;
        assert_eq!(outcome.verdict, AssessmentVerdict::Unresolved);
        assert_eq!(outcome.explanation, "Your skin shows moderate eczema patterns.");

        let requests = script.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1]["contents"][0]["parts"].as_array().unwrap().len(), 1);
        assert_eq!(requests[1]["generationConfig"]["maxOutputTokens"], 200);
    }

    #[actix_web::test]
    async fn total_failure_uses_rule_based_explanation() {
        let (_script, base_url) = serve(vec![(500, String::new()), (500, String::new())]);
        let outcome = assessor(base_url, Some("key")).assess(&[], &context()).await;
        assert_eq!(outcome, ExternalAssessment::unresolved(rule_based_explanation(&context())));
    }

    #[test]
    fn backoff_grows_exponentially() {
        for attempt in 0..3 {
            let delay = backoff_delay(1000, attempt).as_millis() as u64;
            let floor = 1000 << attempt;
            assert!((floor..=floor + 250).contains(&delay));
        }
    }

    #[test]
    fn error_messages() {
        assert_eq!(error_message(r#"{"error": {"message": "quota"}}"#), "quota");
        assert_eq!(error_message(""), "Unknown error");
        assert_eq!(error_message(&"x".repeat(300)).len(), 200);
    }

    #[test]
    fn prompts_carry_context() {
        let mut ctx = context();
        assert!(vision_prompt(&ctx).contains("- Severity: Moderate"));
        ctx.state = PredictionState::Uncertain;
        ctx.severity = None;
        ctx.uncertainty_reason = Some("ambiguous range".into());
        assert!(vision_prompt(&ctx).contains("- Uncertainty: ambiguous range"));
        assert!(text_prompt(&ctx).contains("Could not be classified confidently (ambiguous range)"));
        assert_eq!(mime_type(&[0, 1, 2]), "image/jpeg");
    }
}
