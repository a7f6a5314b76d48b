use crate::api::middleware::request_id::REQUEST_ID_HEADER;
use axum::{
    extract::Request,
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::info;

/// One `request_completed` event per request under the `metrics` target.
///
/// Archives are streamed without a length, so for a batch `latency_ms` is the
/// time until the first member was ready and `response_bytes` is absent.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let request_bytes = content_length(req.headers());
    let request_id = req
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_owned();

    let response = next.run(req).await;

    let response_bytes = content_length(response.headers());
    info!(
        target: "metrics",
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        request_bytes = ?request_bytes,
        response_bytes = ?response_bytes,
        streamed = response_bytes.is_none(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request_completed"
    );

    response
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
