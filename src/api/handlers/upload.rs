use crate::api::error::AppError;
use crate::services::archive::ARCHIVE_FILE_NAME;
use crate::services::upload_collector::{CollectorLimits, collect_uploads};
use axum::{
    body::Body,
    extract::{Multipart, State},
    http::{StatusCode, header},
    response::{Html, Response},
};

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "HTML upload form", content_type = "text/html")
    ),
    tag = "watermark"
)]
pub async fn upload_form(State(state): State<crate::AppState>) -> Html<String> {
    Html(format!(
        "<form enctype=\"multipart/form-data\" method=\"POST\">\
         <input accept=\"image/*\" multiple name=\"{}\" type=\"file\" />\
         <button>Submit</button>\
         </form>",
        state.config.upload_field
    ))
}

#[utoipa::path(
    post,
    path = "/",
    request_body(content = Vec<u8>, content_type = "multipart/form-data", description = "Images to watermark, in the `images` field"),
    responses(
        (status = 200, description = "ZIP archive of watermarked JPEGs", content_type = "application/zip"),
        (status = 400, description = "Wrong field name or too many files", body = crate::models::ErrorResponse),
        (status = 408, description = "Upload stalled", body = crate::models::ErrorResponse),
        (status = 413, description = "Request body too large", body = crate::models::ErrorResponse),
        (status = 500, description = "An image could not be processed", body = crate::models::ErrorResponse)
    ),
    tag = "watermark"
)]
pub async fn process_batch(
    State(state): State<crate::AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let limits = CollectorLimits {
        field_name: state.config.upload_field.clone(),
        max_files: state.config.max_files,
        idle_timeout: state.config.idle_timeout(),
    };
    let files = collect_uploads(&mut multipart, &state.config.staging_dir, &limits).await?;
    tracing::info!("📸 Received batch of {} image(s)", files.len());

    let mut archive = state
        .archiver
        .run(files)
        .with_idle_timeout(state.config.idle_timeout());

    // Wait for the first bytes so a failure on an early image still becomes
    // a proper error response. Later failures abort the body stream instead.
    let first = match archive.next_chunk().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => return Err(e.into()),
        None => {
            return Err(AppError::Internal(
                "Archive stream closed before producing output".to_string(),
            ));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", ARCHIVE_FILE_NAME),
        )
        .body(Body::from_stream(archive.into_body_stream(first)))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}
