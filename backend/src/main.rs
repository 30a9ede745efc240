use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use eczema_backend::assessor::{ExternalAssessor, GeminiAssessor};
use eczema_backend::config::ServiceConfig;
use eczema_backend::routes::configure_routes;
use eczema_backend::{AnalysisPipeline, classifier};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = ServiceConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    })?;

    let classifier = classifier::load(&config.model);

    let gemini = GeminiAssessor::new(config.assessor.clone()).map_err(|e| {
        log::error!("Failed to set up the Gemini client: {}", e);
        std::io::Error::other(e)
    })?;
    if gemini.has_credentials() {
        log::info!("Gemini assessor enabled with model {}", config.assessor.model);
    } else {
        log::warn!("GEMINI_API_KEY not set; explanations will be rule-based");
    }
    let assessor: Arc<dyn ExternalAssessor> = Arc::new(gemini);

    let pipeline = web::Data::new(AnalysisPipeline::new(&config, classifier, assessor));
    let bind_address = config.bind_address();
    log::info!(
        "Starting server on {} (model loaded: {})",
        bind_address,
        pipeline.is_model_loaded()
    );

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allow_any_header()
                    .max_age(3600),
            )
            .app_data(pipeline.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
