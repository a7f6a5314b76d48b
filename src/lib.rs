pub mod api;
pub mod config;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::ServiceConfig;
use crate::services::archive::BatchArchiver;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::get,
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::upload::upload_form,
        api::handlers::upload::process_batch,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "watermark", description = "Batch watermarking endpoints"),
        (name = "system", description = "Service status")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub archiver: Arc<BatchArchiver>,
    pub config: ServiceConfig,
}

pub fn create_app(state: AppState) -> Router {
    // Any GET serves the form and any POST runs a batch, whatever the path.
    let batch_routes = get(api::handlers::upload::upload_form)
        .post(api::handlers::upload::process_batch);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route("/", batch_routes.clone())
        .fallback(batch_routes)
        .layer(DefaultBodyLimit::max(state.config.max_upload_size))
        .layer(from_fn(api::middleware::security::security_headers))
        .layer(from_fn(api::middleware::metrics::metrics_middleware))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .with_state(state)
}
