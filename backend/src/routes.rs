use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError, web};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;
use shared::ErrorResponse;
use uuid::Uuid;

use crate::classifier::ClassifierError;
use crate::imaging::processor::{ImageProcessor, IntakeError};
use crate::pipeline::{AnalysisError, AnalysisPipeline};

const SERVICE_NAME: &str = "eczema-detection";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid file type. Please upload an image file.")]
    InvalidFileType,
    #[error("No image file provided")]
    MissingFile,
    #[error("Failed to read upload")]
    Upload(String),
    #[error("Failed to process image. Please ensure it's a valid image file.")]
    InvalidImage(#[from] IntakeError),
    #[error(
        "Model service is not available. Please ensure the model file is placed in the models/ directory."
    )]
    ModelUnavailable(String),
    #[error("Error processing image")]
    Internal(String),
}

impl ApiError {
    fn detail(&self) -> Option<String> {
        match self {
            ApiError::InvalidFileType | ApiError::MissingFile => None,
            ApiError::InvalidImage(e) => Some(e.to_string()),
            ApiError::Upload(detail)
            | ApiError::ModelUnavailable(detail)
            | ApiError::Internal(detail) => Some(detail.clone()),
        }
    }
}

impl From<AnalysisError> for ApiError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::Intake(e) => ApiError::InvalidImage(e),
            AnalysisError::Classifier(ClassifierError::ModelUnavailable(reason)) => {
                ApiError::ModelUnavailable(reason)
            }
            AnalysisError::Classifier(e @ ClassifierError::InferenceFailure(_)) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidFileType
            | ApiError::MissingFile
            | ApiError::Upload(_)
            | ApiError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            ApiError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            detail: self.detail(),
        })
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    model_loaded: bool,
    model_path: String,
    model_exists: bool,
    checked_at: DateTime<Utc>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/analyze").route(web::post().to(analyze)));
}

async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Eczema Detection API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "analyze": "/analyze",
            "health": "/health"
        }
    }))
}

async fn health(pipeline: web::Data<AnalysisPipeline>) -> HttpResponse {
    let model_path = pipeline.model_path();
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        model_loaded: pipeline.is_model_loaded(),
        model_path: model_path.display().to_string(),
        model_exists: model_path.exists(),
        checked_at: Utc::now(),
    })
}

async fn analyze(
    pipeline: web::Data<AnalysisPipeline>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let request_id = Uuid::new_v4();
    let image_data = read_image_field(&mut payload, pipeline.max_upload_bytes()).await?;
    info!(
        "[{}] Analyzing upload of {} bytes, fingerprint {}",
        request_id,
        image_data.len(),
        ImageProcessor::fingerprint(&image_data)
    );

    let blocking = pipeline.clone();
    let (image_data, prepared) = web::block(move || {
        let prepared = blocking.prepare(&image_data);
        (image_data, prepared)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    let prepared = prepared.map_err(|e| {
        match &e {
            AnalysisError::Intake(_) => warn!("[{}] Rejected upload: {}", request_id, e),
            AnalysisError::Classifier(_) => error!("[{}] Analysis failed: {}", request_id, e),
        }
        ApiError::from(e)
    })?;

    let response = pipeline.complete(&image_data, prepared).await;
    info!(
        "[{}] Prediction {} (confidence {:.2}, relevant {})",
        request_id, response.prediction, response.confidence, response.relevant
    );
    Ok(HttpResponse::Ok().json(response))
}

/// Reads the first file field, refusing non-image content types and oversized bodies.
async fn read_image_field(payload: &mut Multipart, max_bytes: usize) -> Result<Vec<u8>, ApiError> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| ApiError::Upload(e.to_string()))?
    {
        let is_file = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .is_some();
        if !is_file {
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| ApiError::Upload(e.to_string()))?;
            }
            continue;
        }

        let is_image = field
            .content_type()
            .is_some_and(|mime| mime.type_().as_str() == "image");
        if !is_image {
            return Err(ApiError::InvalidFileType);
        }

        let mut image_data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| ApiError::Upload(e.to_string()))?;
            if image_data.len() + chunk.len() > max_bytes {
                return Err(IntakeError::TooLarge {
                    size: image_data.len() + chunk.len(),
                    max: max_bytes,
                }
                .into());
            }
            image_data.extend_from_slice(&chunk);
        }
        return Ok(image_data);
    }
    Err(ApiError::MissingFile)
}
