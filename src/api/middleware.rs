//! API Middleware
//!
//! Per-request execution context and request logging.

use axum::{
    body::Body,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::domain::OperationContext;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

// =========================================================================
// Execution context
// =========================================================================

/// Attach an `OperationContext` carrying the caller's correlation id, or a
/// fresh one, to every request
pub async fn context_middleware(mut request: Request<Body>, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    request
        .extensions_mut()
        .insert(OperationContext::new().with_correlation_id(correlation_id));

    let mut response = next.run(request).await;
    if let Ok(value) = correlation_id.to_string().parse() {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

// =========================================================================
// Request logging
// =========================================================================

/// Headers never written to logs in clear text
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie"];

/// Header pairs as they may appear in logs
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = match value.to_str() {
                _ if SENSITIVE_HEADERS.contains(&name.as_str()) => "[REDACTED]",
                Ok(text) => text,
                Err(_) => "[invalid utf8]",
            };
            (name.to_string(), shown.to_string())
        })
        .collect()
}

/// One line per finished request: method, path, status and latency
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let correlation_id = request
        .extensions()
        .get::<OperationContext>()
        .and_then(|ctx| ctx.correlation_id);

    tracing::debug!(
        %method,
        %path,
        headers = ?mask_headers_for_logging(request.headers()),
        "Incoming request"
    );

    let start = std::time::Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    match status {
        500.. => tracing::error!(%method, %path, status, latency_ms, ?correlation_id, "Request failed"),
        400..=499 => tracing::warn!(%method, %path, status, latency_ms, ?correlation_id, "Request rejected"),
        _ => tracing::info!(%method, %path, status, latency_ms, ?correlation_id, "Request completed"),
    }

    response
}
