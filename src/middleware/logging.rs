//! Request logging middleware.
//!
//! One structured line per request with method, path, status, latency, and
//! the request id the pipeline stamped on the response. Bodies are never
//! logged; at this layer they may still contain unvalidated input.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

/// Paths that would drown the log at probe frequency.
fn is_quiet_path(path: &str) -> bool {
    path == "/health"
}

pub async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if is_quiet_path(&path) {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    // The pipeline sets X-Request-Id on every response it builds; requests
    // rejected before the pipeline (404s, oversized bodies cut by the
    // outer limit layer) won't have one.
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            client_ip = %addr.ip(),
            request_id = %request_id,
            "Request failed"
        );
    } else if status >= 400 {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            client_ip = %addr.ip(),
            request_id = %request_id,
            "Request rejected"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            request_id = %request_id,
            "Request completed"
        );
    }

    response
}
