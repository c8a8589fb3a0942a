use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    // A UUID without hyphens is exactly 32 hex chars (128 bits).
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a short connection ID (16 hex characters).
pub fn generate_connection_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Span covering the whole lifetime of one bound WebSocket connection.
pub fn connection_span(logical_key: &str, connection_id: &str) -> tracing::Span {
    tracing::info_span!(
        "connection",
        logical_key = %logical_key,
        connection_id = %connection_id,
        session_id = tracing::field::Empty,
    )
}

/// Axum middleware that injects `X-Request-Id` headers and runs the request
/// inside a tracing span.
///
/// An incoming `X-Request-Id` is reused; otherwise a new trace ID is
/// generated. The response always carries the header.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_trace_id);

    request.headers_mut().insert(
        "x-request-id",
        request_id
            .parse()
            .unwrap_or_else(|_| axum::http::HeaderValue::from_static("unknown")),
    );

    let span = tracing::info_span!(
        "http_request",
        trace_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span).await;

    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert("x-request-id", val);
    }

    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
