//! Response construction.
//!
//! Every response carries `X-Request-Id` and CORS headers. Production
//! collapses most 4xx bodies to a generic "Invalid request" so callers
//! cannot probe which check failed; non-production keeps the descriptive
//! error and optional details. Rejections are counted and logged at
//! sampled rates.

use std::collections::HashMap;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tracing::info;

use super::context::RequestContext;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const ALLOWED_REQUEST_HEADERS: &str =
    "Content-Type, X-Tracking-Guardian-Signature, X-Tracking-Guardian-Timestamp";

fn apply_common_headers(mut response: Response, request_id: &str, origin: Option<&str>) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    let allow_origin = origin.unwrap_or("*");
    if let Ok(value) = HeaderValue::from_str(allow_origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    response
}

/// 204 preflight answer with the CORS contract the pixel relies on.
pub fn preflight(request_id: &str, origin: Option<&str>) -> Response {
    let response = (
        StatusCode::NO_CONTENT,
        [
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("POST, OPTIONS"),
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOWED_REQUEST_HEADERS),
            ),
            (
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static("600"),
            ),
        ],
    )
        .into_response();
    apply_common_headers(response, request_id, origin)
}

pub fn accepted(ctx: &RequestContext, accepted_count: usize) -> Response {
    let response = (
        StatusCode::ACCEPTED,
        Json(json!({ "accepted_count": accepted_count, "errors": [] })),
    )
        .into_response();
    apply_common_headers(response, &ctx.request_id, ctx.origin.as_deref())
}

/// Intentional no-op: the client must not retry.
pub fn silent_drop(ctx: &RequestContext) -> Response {
    let response = StatusCode::NO_CONTENT.into_response();
    apply_common_headers(response, &ctx.request_id, ctx.origin.as_deref())
}

/// A 4xx with the production/non-production body policy applied.
pub fn client_error(
    ctx: &RequestContext,
    status: StatusCode,
    message: &str,
    details: Option<Value>,
) -> Response {
    let body = if ctx.is_production {
        json!({ "error": "Invalid request" })
    } else {
        match details {
            Some(details) => json!({ "error": message, "details": details }),
            None => json!({ "error": message }),
        }
    };
    let response = (status, Json(body)).into_response();
    apply_common_headers(response, &ctx.request_id, ctx.origin.as_deref())
}

pub fn payload_too_large(ctx: &RequestContext, max_bytes: usize) -> Response {
    if ctx.is_production {
        return client_error(ctx, StatusCode::PAYLOAD_TOO_LARGE, "Payload too large", None);
    }
    let response = (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(json!({ "error": "Payload too large", "maxSize": max_bytes })),
    )
        .into_response();
    apply_common_headers(response, &ctx.request_id, ctx.origin.as_deref())
}

pub fn unsupported_media_type(ctx: &RequestContext) -> Response {
    client_error(
        ctx,
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        "Content-Type must be application/json or text/plain",
        None,
    )
}

pub fn too_many_requests(ctx: &RequestContext, limit: u32, retry_after_secs: u64, reset_ms: i64) -> Response {
    let response = (
        StatusCode::TOO_MANY_REQUESTS,
        [
            ("Retry-After", retry_after_secs.to_string()),
            ("X-RateLimit-Limit", limit.to_string()),
            ("X-RateLimit-Remaining", "0".to_string()),
            ("X-RateLimit-Reset", reset_ms.to_string()),
        ],
        Json(json!({ "error": "Too Many Requests", "retryAfter": retry_after_secs })),
    )
        .into_response();
    apply_common_headers(response, &ctx.request_id, ctx.origin.as_deref())
}

pub fn service_unavailable(ctx: &RequestContext, message: &str, retry_after_secs: u64) -> Response {
    let response = (
        StatusCode::SERVICE_UNAVAILABLE,
        [("Retry-After", retry_after_secs.to_string())],
        Json(json!({ "error": "Service Unavailable", "message": message })),
    )
        .into_response();
    apply_common_headers(response, &ctx.request_id, ctx.origin.as_deref())
}

/// Internal invariant violation. The body stays generic in every mode.
pub fn internal_error(ctx: &RequestContext) -> Response {
    let response = (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response();
    apply_common_headers(response, &ctx.request_id, ctx.origin.as_deref())
}

/// High-frequency rejection reasons are sampled at 0.1%, everything else
/// at 1%, so log volume stays flat under abuse.
const HIGH_FREQUENCY_REASONS: [&str; 3] = ["invalid_json", "rate_limited", "origin_rejected"];

#[derive(Default)]
pub struct RejectionTracker {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl RejectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, reason: &'static str, request_id: &str) {
        let total = {
            let mut counters = self.counters.lock();
            let entry = counters.entry(reason).or_insert(0);
            *entry += 1;
            *entry
        };

        let sample_rate = if HIGH_FREQUENCY_REASONS.contains(&reason) {
            0.001
        } else {
            0.01
        };
        if rand::thread_rng().gen::<f64>() < sample_rate {
            info!(reason, total, request_id, "Rejection sample");
        }
    }

    pub fn count(&self, reason: &str) -> u64 {
        *self.counters.lock().get(reason).unwrap_or(&0)
    }
}
