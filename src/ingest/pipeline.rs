//! Stage composition and the HTTP handlers.
//!
//! `POST /ingest` runs the ordered stage chain; each stage returns either
//! `Continue` with the updated context or `Halt` with the terminal
//! response. If the chain runs off the end without a terminal stage, that
//! is a bug and the handler answers 500.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info, warn};

use super::body::{content_type_ok, parse_batch, BodyError};
use super::context::{new_request_id, RequestContext};
use super::origin::{check_post_shop, check_pre_body, OriginDecision};
use super::responses;
use super::responses::RejectionTracker;
use super::timestamp::{check_timestamp, TimestampCheck};
use super::validate::{validate_batch, BatchRejection};
use crate::auth::abuse;
use crate::auth::hmac::{self, HmacErrorCode, SecretSlot, SignatureInput, VerifyOutcome};
use crate::middleware::rate_limit::{ip_shop_key, shop_ip_key, RateLimitConfig, RateLimitDecision, RateLimiter};
use crate::models::{now_ms, Config, KeyValidation, KeyValidationReason, SignatureSource};
use crate::queue::{DurableQueue, QueueEntry, RequestMeta};
use crate::shop::ShopStore;
use crate::store::kv::KvStore;

pub enum StageOutcome {
    Continue(RequestContext),
    Halt(Response),
}

macro_rules! stage {
    ($outcome:expr) => {
        match $outcome {
            StageOutcome::Continue(ctx) => ctx,
            StageOutcome::Halt(response) => return response,
        }
    };
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub shops: Arc<ShopStore>,
    pub kv: Arc<dyn KvStore>,
    pub queue: Arc<DurableQueue>,
    pub pre_limiter: Arc<RateLimiter>,
    pub shop_limiter: Arc<RateLimiter>,
    pub rejections: Arc<RejectionTracker>,
}

impl AppState {
    pub fn new(config: Config, shops: ShopStore, kv: Arc<dyn KvStore>) -> Self {
        let limit_config = RateLimitConfig {
            max_requests: config.rate_limit_max,
            window: config.rate_limit_window,
        };
        // Production requires an explicit opt-in to run on the local
        // fallback window; everywhere else degrading is better than a 503.
        let fallback_allowed = config.allow_store_fallback || !config.is_production;

        let queue = Arc::new(DurableQueue::new(kv.clone(), config.max_queue_size));
        Self {
            config: Arc::new(config),
            shops: Arc::new(shops),
            kv: kv.clone(),
            queue,
            pre_limiter: Arc::new(RateLimiter::new(
                limit_config.clone(),
                kv.clone(),
                fallback_allowed,
            )),
            shop_limiter: Arc::new(RateLimiter::new(limit_config, kv, fallback_allowed)),
            rejections: Arc::new(RejectionTracker::new()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_cap = state.config.max_body_bytes;
    Router::new()
        .route("/ingest", post(handle_ingest).options(handle_preflight))
        .route("/health", get(health))
        // Outer guard only; the precise cap (and its response shape) is
        // enforced in the body stage.
        .layer(RequestBodyLimitLayer::new(body_cap + 4096))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn handle_preflight(headers: HeaderMap) -> Response {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .filter(|origin| *origin != "null");
    responses::preflight(&new_request_id(now_ms()), origin)
}

pub async fn handle_ingest(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let ctx = RequestContext::from_request(&parts.headers, remote, &state.config);

    let ctx = stage!(stage_pre_rate_limit(&state, ctx).await);
    let ctx = stage!(stage_origin_pre(&state, ctx));
    let ctx = stage!(stage_signature_gate(&state, ctx));
    let ctx = stage!(stage_timestamp(&state, ctx));
    let ctx = stage!(stage_body(&state, ctx, body).await);
    let ctx = stage!(stage_validate(&state, ctx));
    let ctx = stage!(stage_shop(&state, ctx).await);
    let ctx = stage!(stage_origin_post(&state, ctx));
    let ctx = stage!(stage_shop_rate_limit(&state, ctx).await);
    let ctx = stage!(stage_hmac(&state, ctx).await);

    stage_enqueue(&state, ctx).await
}

/// Per-(IP, claimed shop) throttle before the body is read.
async fn stage_pre_rate_limit(state: &AppState, ctx: RequestContext) -> StageOutcome {
    let key = ip_shop_key(&ctx.client_ip, ctx.shop_domain_header.as_deref());
    rate_limit_outcome(state, ctx, state.pre_limiter.check(&key).await)
}

/// Per-(resolved shop, IP) throttle after the shop is known.
async fn stage_shop_rate_limit(state: &AppState, ctx: RequestContext) -> StageOutcome {
    let Some(shop_domain) = ctx.shop_domain.clone() else {
        return StageOutcome::Halt(responses::internal_error(&ctx));
    };
    let key = shop_ip_key(&shop_domain, &ctx.client_ip);
    rate_limit_outcome(state, ctx, state.shop_limiter.check(&key).await)
}

fn rate_limit_outcome(
    state: &AppState,
    ctx: RequestContext,
    decision: RateLimitDecision,
) -> StageOutcome {
    match decision {
        RateLimitDecision::Allowed { .. } => StageOutcome::Continue(ctx),
        RateLimitDecision::Limited {
            limit,
            retry_after_secs,
            reset_ms,
        } => {
            state.rejections.record("rate_limited", &ctx.request_id);
            StageOutcome::Halt(responses::too_many_requests(
                &ctx,
                limit,
                retry_after_secs,
                reset_ms,
            ))
        }
        RateLimitDecision::StoreUnavailable => StageOutcome::Halt(responses::service_unavailable(
            &ctx,
            "rate limit store unreachable",
            60,
        )),
    }
}

/// Pre-body origin pass: static allowlist.
fn stage_origin_pre(state: &AppState, ctx: RequestContext) -> StageOutcome {
    let decision = check_pre_body(
        ctx.origin.as_deref(),
        ctx.origin_header_present,
        ctx.is_null_origin,
        ctx.has_signature(),
        &state.config,
    );
    origin_outcome(state, ctx, decision)
}

/// Post-shop origin pass: the shop's own domains join the allowlist.
fn stage_origin_post(state: &AppState, ctx: RequestContext) -> StageOutcome {
    let Some(shop) = ctx.shop.as_ref() else {
        return StageOutcome::Halt(responses::internal_error(&ctx));
    };
    let hosts = shop.allowed_origin_hosts();
    let decision = check_post_shop(
        ctx.origin.as_deref(),
        ctx.origin_header_present,
        ctx.is_null_origin,
        ctx.has_signature(),
        &hosts,
        &state.config,
    );
    origin_outcome(state, ctx, decision)
}

fn origin_outcome(
    state: &AppState,
    ctx: RequestContext,
    decision: OriginDecision,
) -> StageOutcome {
    match decision {
        OriginDecision::Allow => StageOutcome::Continue(ctx),
        OriginDecision::AllowLogged(reason) => {
            debug!(
                request_id = %ctx.request_id,
                origin = ctx.origin.as_deref().unwrap_or("<none>"),
                reason,
                "Origin allowed with note"
            );
            StageOutcome::Continue(ctx)
        }
        OriginDecision::Reject(reason) => {
            state.rejections.record("origin_rejected", &ctx.request_id);
            StageOutcome::Halt(responses::client_error(
                &ctx,
                StatusCode::FORBIDDEN,
                "Origin not allowed",
                Some(json!({ "reason": reason })),
            ))
        }
    }
}

/// Production refuses unsigned requests before spending anything on
/// the body. (Body-envelope signatures are a non-production convenience.)
fn stage_signature_gate(state: &AppState, ctx: RequestContext) -> StageOutcome {
    if ctx.is_production && !ctx.has_signature() {
        state.rejections.record("missing_signature", &ctx.request_id);
        return StageOutcome::Halt(responses::client_error(
            &ctx,
            StatusCode::FORBIDDEN,
            "Missing signature",
            None,
        ));
    }
    StageOutcome::Continue(ctx)
}

/// Clock-skew window on the timestamp header.
fn stage_timestamp(state: &AppState, mut ctx: RequestContext) -> StageOutcome {
    match check_timestamp(
        ctx.timestamp_header.as_deref(),
        ctx.has_signature(),
        ctx.is_production,
        ctx.received_at,
        state.config.timestamp_window_ms,
    ) {
        TimestampCheck::Valid(parsed) => {
            ctx.parsed_timestamp = parsed;
            StageOutcome::Continue(ctx)
        }
        TimestampCheck::MissingRequired => {
            state
                .rejections
                .record("missing_timestamp_header", &ctx.request_id);
            StageOutcome::Halt(responses::client_error(
                &ctx,
                StatusCode::FORBIDDEN,
                "Missing timestamp header",
                None,
            ))
        }
        TimestampCheck::Stale => {
            state.rejections.record("stale_timestamp", &ctx.request_id);
            StageOutcome::Halt(responses::silent_drop(&ctx))
        }
    }
}

/// Bounded read, content-type gate, batch extraction, and (outside
/// production) body-envelope signature pickup.
async fn stage_body(state: &AppState, mut ctx: RequestContext, body: Body) -> StageOutcome {
    if !content_type_ok(ctx.content_type.as_deref()) {
        state
            .rejections
            .record("unsupported_media_type", &ctx.request_id);
        return StageOutcome::Halt(responses::unsupported_media_type(&ctx));
    }

    let max_body = state.config.max_body_bytes;
    if ctx.content_length.map(|len| len > max_body).unwrap_or(false) {
        state.rejections.record("payload_too_large", &ctx.request_id);
        return StageOutcome::Halt(responses::payload_too_large(&ctx, max_body));
    }

    let bytes = match axum::body::to_bytes(body, max_body).await {
        Ok(bytes) => bytes,
        Err(_) => {
            state.rejections.record("payload_too_large", &ctx.request_id);
            return StageOutcome::Halt(responses::payload_too_large(&ctx, max_body));
        }
    };

    let Ok(text) = String::from_utf8(bytes.to_vec()) else {
        state.rejections.record("invalid_json", &ctx.request_id);
        return StageOutcome::Halt(responses::client_error(
            &ctx,
            StatusCode::BAD_REQUEST,
            "Request body is not valid UTF-8",
            None,
        ));
    };

    let parsed = match parse_batch(&text, state.config.max_batch_size) {
        Ok(parsed) => parsed,
        Err(error) => {
            state.rejections.record(error.reason(), &ctx.request_id);
            let (message, details) = match error {
                BodyError::InvalidJson => ("Invalid JSON body", None),
                BodyError::EmptyBatch => ("Batch contains no events", None),
                BodyError::BatchTooLarge => (
                    "Batch exceeds the maximum size",
                    Some(json!({ "maxBatch": state.config.max_batch_size })),
                ),
            };
            return StageOutcome::Halt(responses::client_error(
                &ctx,
                StatusCode::BAD_REQUEST,
                message,
                details,
            ));
        }
    };

    // Header signatures sign the exact bytes on the wire; body-envelope
    // signatures sign the envelope minus the carrier fields.
    if ctx.has_signature() {
        ctx.body_hash = Some(hmac::body_hash(&bytes));
    } else if let Some(envelope) = &parsed.envelope_signature {
        if !ctx.is_production {
            ctx.signature = Some(envelope.signature.clone());
            ctx.signature_source = SignatureSource::Body;
            ctx.envelope_signature_timestamp = envelope.timestamp;
            ctx.envelope_shop_domain = envelope.shop_domain.clone();
            ctx.body_hash = Some(hmac::canonical_body_hash(&parsed.parsed));
        }
    } else {
        ctx.body_hash = Some(hmac::body_hash(&bytes));
    }

    ctx.body = Some(text);
    ctx.raw_events = parsed.raw_events;
    ctx.batch_timestamp = parsed.batch_timestamp;
    ctx.parsed_body = Some(parsed.parsed);
    StageOutcome::Continue(ctx)
}

/// Per-event validation plus the batch-level shop-domain invariants.
fn stage_validate(state: &AppState, mut ctx: RequestContext) -> StageOutcome {
    match validate_batch(
        &ctx.raw_events,
        ctx.shop_domain_header.as_deref(),
        ctx.is_production,
        &ctx.request_id,
    ) {
        Ok(outcome) => {
            if outcome.skipped > 0 {
                state.rejections.record("event_skipped", &ctx.request_id);
            }
            ctx.shop_domain = Some(outcome.shop_domain);
            ctx.validated_events = outcome.events;
            StageOutcome::Continue(ctx)
        }
        Err(rejection) => {
            let (status, reason, message, details) = match &rejection {
                BatchRejection::FirstEventInvalid(detail) => (
                    StatusCode::BAD_REQUEST,
                    "first_event_invalid",
                    "First event failed validation",
                    Some(json!({ "reason": detail })),
                ),
                BatchRejection::NoValidEvents => (
                    StatusCode::BAD_REQUEST,
                    "no_valid_events",
                    "No valid events in batch",
                    None,
                ),
                BatchRejection::MixedShopDomains { first, other } => (
                    if ctx.is_production {
                        StatusCode::FORBIDDEN
                    } else {
                        StatusCode::BAD_REQUEST
                    },
                    "mixed_shop_domains",
                    "Events disagree on shopDomain",
                    Some(json!({ "first": first, "other": other })),
                ),
                BatchRejection::HeaderDomainMismatch { header, payload } => (
                    StatusCode::FORBIDDEN,
                    "shop_domain_mismatch",
                    "Shop domain header does not match payload",
                    Some(json!({ "header": header, "payload": payload })),
                ),
            };
            state.rejections.record(reason, &ctx.request_id);
            StageOutcome::Halt(responses::client_error(&ctx, status, message, details))
        }
    }
}

/// Resolve the shop and derive mode + enabled destinations.
async fn stage_shop(state: &AppState, mut ctx: RequestContext) -> StageOutcome {
    let Some(shop_domain) = ctx.shop_domain.clone() else {
        return StageOutcome::Halt(responses::internal_error(&ctx));
    };

    let shop = match state.shops.load_shop(&shop_domain, ctx.environment).await {
        Ok(shop) => shop,
        Err(error) => {
            warn!(request_id = %ctx.request_id, error = %error, "Shop store unavailable");
            return StageOutcome::Halt(responses::service_unavailable(
                &ctx,
                "shop store unavailable",
                30,
            ));
        }
    };

    // Production answers 403 either way so callers cannot probe which
    // shops exist.
    let unauthorized_status = if ctx.is_production {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::UNAUTHORIZED
    };

    let Some(shop) = shop else {
        state.rejections.record("unknown_shop", &ctx.request_id);
        return StageOutcome::Halt(responses::client_error(
            &ctx,
            unauthorized_status,
            "Unknown shop",
            None,
        ));
    };
    if !shop.is_active {
        state.rejections.record("inactive_shop", &ctx.request_id);
        return StageOutcome::Halt(responses::client_error(
            &ctx,
            unauthorized_status,
            "Shop is inactive",
            None,
        ));
    }

    ctx.mode = Some(shop.pipeline_mode());
    ctx.enabled_pixel_configs = shop.enabled_server_side_configs();
    ctx.shop = Some(shop);
    StageOutcome::Continue(ctx)
}

/// HMAC verification, key rotation annotations, abuse heuristics.
async fn stage_hmac(state: &AppState, mut ctx: RequestContext) -> StageOutcome {
    let Some(shop) = ctx.shop.clone() else {
        return StageOutcome::Halt(responses::internal_error(&ctx));
    };
    let Some(shop_domain) = ctx.shop_domain.clone() else {
        return StageOutcome::Halt(responses::internal_error(&ctx));
    };

    if !ctx.has_signature() {
        if ctx.allow_unsigned {
            debug!(request_id = %ctx.request_id, "Accepting unsigned batch (allowed by environment)");
            ctx.key_validation = Some(KeyValidation::skipped_env());
            return StageOutcome::Continue(ctx);
        }
        // Production halted at the signature gate; outside production an
        // unsigned batch continues untrusted.
        warn!(request_id = %ctx.request_id, "Unsigned batch accepted as untrusted");
        ctx.key_validation = Some(KeyValidation::failed(KeyValidationReason::SignatureMissing));
        return StageOutcome::Continue(ctx);
    }

    let Some(body_hash) = ctx.body_hash.clone() else {
        return StageOutcome::Halt(responses::internal_error(&ctx));
    };

    let signature_timestamp = match ctx.signature_source {
        SignatureSource::Header => ctx.parsed_timestamp,
        SignatureSource::Body => ctx.envelope_signature_timestamp,
        SignatureSource::None => None,
    };

    let input = SignatureInput {
        signature: ctx.signature.as_deref(),
        source: ctx.signature_source,
        signature_timestamp,
        batch_timestamp: ctx.batch_timestamp,
        signed_shop_domain: ctx.envelope_shop_domain.as_deref(),
        shop_domain: &shop_domain,
        body_hash: &body_hash,
    };

    match hmac::verify_signature(
        &input,
        &shop,
        ctx.received_at,
        state.config.timestamp_window_ms,
    ) {
        VerifyOutcome::Verified { slot } => {
            if slot == SecretSlot::Pending {
                if let Err(error) = state.shops.increment_pending_match(shop.id).await {
                    warn!(request_id = %ctx.request_id, error = %error, "Failed to count pending-secret match");
                }
            }
            ctx.key_validation = Some(KeyValidation::verified(slot == SecretSlot::Previous));

            if let Some(stats) = abuse::analyze_batch(&ctx.raw_events, &ctx.validated_events) {
                if stats.is_anomalous() {
                    abuse::record_anomaly(&shop_domain, &ctx.request_id, &stats);
                    state.rejections.record("abuse_anomaly", &ctx.request_id);
                    if ctx.is_production {
                        return StageOutcome::Halt(responses::client_error(
                            &ctx,
                            StatusCode::FORBIDDEN,
                            "Batch rejected",
                            None,
                        ));
                    }
                }
            }
            StageOutcome::Continue(ctx)
        }
        VerifyOutcome::Failed {
            code: HmacErrorCode::SecretMissing,
            ..
        } => {
            ctx.key_validation = Some(KeyValidation::failed(KeyValidationReason::SecretMissing));
            if ctx.is_production {
                return StageOutcome::Halt(responses::service_unavailable(
                    &ctx,
                    "signing secret unavailable",
                    300,
                ));
            }
            warn!(request_id = %ctx.request_id, "Shop has no signing secret; continuing untrusted");
            StageOutcome::Continue(ctx)
        }
        VerifyOutcome::Failed { code, detail } => {
            let reason = match code {
                HmacErrorCode::MissingSignature => KeyValidationReason::SignatureMissing,
                HmacErrorCode::InvalidSignature => KeyValidationReason::HmacInvalid,
                _ => KeyValidationReason::HmacNotVerified,
            };
            ctx.key_validation = Some(KeyValidation::failed(reason));
            state.rejections.record("hmac_failed", &ctx.request_id);

            if ctx.is_production {
                return StageOutcome::Halt(responses::client_error(
                    &ctx,
                    StatusCode::FORBIDDEN,
                    code.as_str(),
                    detail.map(|d| json!({ "detail": d })),
                ));
            }
            warn!(
                request_id = %ctx.request_id,
                code = code.as_str(),
                detail = detail.as_deref().unwrap_or(""),
                "Signature verification failed; continuing untrusted"
            );
            StageOutcome::Continue(ctx)
        }
    }
}

/// Package the accepted batch and push it onto the durable queue.
async fn stage_enqueue(state: &AppState, ctx: RequestContext) -> Response {
    let (Some(shop), Some(shop_domain), Some(mode), Some(key_validation)) = (
        ctx.shop.as_ref(),
        ctx.shop_domain.clone(),
        ctx.mode,
        ctx.key_validation.clone(),
    ) else {
        return responses::internal_error(&ctx);
    };

    let page_url = ctx
        .validated_events
        .iter()
        .find_map(|event| event.payload.data.page_url.clone());

    let entry = QueueEntry {
        request_id: ctx.request_id.clone(),
        shop_id: shop.id,
        shop_domain: shop_domain.clone(),
        environment: ctx.environment,
        mode,
        validated_events: ctx.validated_events.clone(),
        key_validation,
        origin: ctx.origin.clone(),
        request_context: RequestMeta {
            ip: ctx.client_ip.to_string(),
            user_agent: ctx.user_agent.clone(),
            page_url,
            referrer: ctx.referer.clone(),
        },
        enabled_pixel_configs: ctx.enabled_pixel_configs.clone(),
    };

    if let Err(error) = state.queue.enqueue(&entry).await {
        warn!(request_id = %ctx.request_id, error = %error, "Queue push failed");
        state.rejections.record("queue_unavailable", &ctx.request_id);
        return responses::service_unavailable(&ctx, "ingest queue unavailable", 30);
    }

    info!(
        request_id = %ctx.request_id,
        shop = %shop_domain,
        events = ctx.validated_events.len(),
        trust = ctx
            .key_validation
            .as_ref()
            .map(|kv| kv.trust_level.as_str())
            .unwrap_or("unknown"),
        "Batch accepted"
    );
    responses::accepted(&ctx, ctx.validated_events.len())
}

/// Build an AppState wired to in-memory stores. Test helper.
#[doc(hidden)]
pub fn test_state(config: Config, shops: ShopStore) -> AppState {
    let kv: Arc<dyn KvStore> = Arc::new(crate::store::kv::MemoryKv::new());
    AppState::new(config, shops, kv)
}
