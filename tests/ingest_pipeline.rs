//! End-to-end tests for the ingest pipeline, driving the router directly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use guardian_backend::auth::hmac::{body_hash, compute_signature};
use guardian_backend::auth::SecretCipher;
use guardian_backend::ingest::{router, AppState};
use guardian_backend::models::{now_ms, Config};
use guardian_backend::queue::QueueEntry;
use guardian_backend::shop::store::NewShop;
use guardian_backend::shop::ShopStore;
use guardian_backend::store::kv::MemoryKv;
use guardian_backend::store::nonce::{NonceStore, DEFAULT_NONCE_TTL};
use guardian_backend::store::receipts::ReceiptStore;
use guardian_backend::worker::{run_once, SqliteEventPersister, WorkerDeps};

const SHOP: &str = "s.myshopify.com";
const SECRET: &str = "whsec_integration";

struct Harness {
    state: AppState,
    app: Router,
    shop_id: i64,
}

async fn harness(mutate: impl FnOnce(&mut Config)) -> Harness {
    let mut config = Config::for_tests();
    mutate(&mut config);

    let shops = ShopStore::open_in_memory(SecretCipher::plaintext()).unwrap();
    let environment = config.default_environment();
    let shop_id = shops
        .create_shop(&NewShop {
            shop_domain: SHOP.to_string(),
            environment: Some(environment),
            is_active: true,
            current_secret: Some(SECRET.to_string()),
            previous_secret: Some("whsec_previous".to_string()),
            previous_secret_expires_at: Some(now_ms() + 86_400_000),
            ..Default::default()
        })
        .await
        .unwrap();
    shops
        .add_pixel_config(shop_id, "meta", true, &json!({}))
        .await
        .unwrap();
    shops
        .add_pixel_config(shop_id, "google_analytics", true, &json!({}))
        .await
        .unwrap();

    let kv = Arc::new(MemoryKv::new());
    let state = AppState::new(config, shops, kv);
    let app = router(state.clone());
    Harness {
        state,
        app,
        shop_id,
    }
}

fn purchase_batch(timestamp: i64, order_id: &str) -> String {
    json!({
        "events": [{
            "eventName": "checkout_completed",
            "timestamp": timestamp,
            "shopDomain": SHOP,
            "consent": {"marketing": true, "analytics": true},
            "data": {"orderId": order_id, "value": 12.3, "currency": "USD"},
        }],
        "timestamp": timestamp,
    })
    .to_string()
}

fn signed_request(body: &str, timestamp: i64, secret: &str) -> Request<Body> {
    let hash = body_hash(body.as_bytes());
    let signature = compute_signature(secret, timestamp, SHOP, &hash);
    request_with_headers(
        body,
        &[
            ("x-tracking-guardian-signature", signature.as_str()),
            ("x-tracking-guardian-timestamp", &timestamp.to_string()),
        ],
    )
}

fn request_with_headers(body: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json")
        .header("origin", format!("https://{SHOP}"));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut request = builder.body(Body::from(body.to_string())).unwrap();
    let remote: SocketAddr = "203.0.113.9:443".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(remote));
    request
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body, headers)
}

fn worker_deps(harness: &Harness) -> (WorkerDeps, Arc<ReceiptStore>, Arc<SqliteEventPersister>) {
    let receipts = Arc::new(ReceiptStore::open_in_memory().unwrap());
    let persister = Arc::new(SqliteEventPersister::open_in_memory().unwrap());
    let deps = WorkerDeps {
        config: harness.state.config.clone(),
        queue: harness.state.queue.clone(),
        receipts: receipts.clone(),
        nonces: Arc::new(NonceStore::new(harness.state.kv.clone(), DEFAULT_NONCE_TTL)),
        persister: persister.clone(),
    };
    (deps, receipts, persister)
}

#[tokio::test]
async fn preflight_answers_204_with_cors() {
    let harness = harness(|_| {}).await;
    let mut request = Request::builder()
        .method("OPTIONS")
        .uri("/ingest")
        .header("origin", format!("https://{SHOP}"))
        .body(Body::empty())
        .unwrap();
    let remote: SocketAddr = "203.0.113.9:443".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(remote));

    let (status, _, headers) = send(&harness.app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "POST, OPTIONS"
    );
    let allow_headers = headers
        .get("access-control-allow-headers")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(allow_headers.contains("X-Tracking-Guardian-Signature"));
    assert!(allow_headers.contains("X-Tracking-Guardian-Timestamp"));
}

#[tokio::test]
async fn happy_path_purchase_accepted_and_receipted() {
    let harness = harness(|_| {}).await;
    let ts = now_ms();
    let body = purchase_batch(ts, "gid://shopify/Order/1");

    let (status, json, headers) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["accepted_count"], 1);
    assert_eq!(json["errors"], json!([]));
    assert!(headers.contains_key("x-request-id"));

    assert_eq!(harness.state.queue.pending_len().await.unwrap(), 1);

    let (deps, receipts, persister) = worker_deps(&harness);
    let report = run_once(&deps).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.receipts_written, 1);

    assert_eq!(
        receipts
            .purchase_receipt_count(harness.shop_id, "gid://shopify/Order/1")
            .await
            .unwrap(),
        1
    );
    assert_eq!(persister.count_for_shop(harness.shop_id).await.unwrap(), 1);
}

#[tokio::test]
async fn duplicate_order_in_batch_yields_single_receipt() {
    let harness = harness(|_| {}).await;
    let ts = now_ms();
    let event = json!({
        "eventName": "checkout_completed",
        "timestamp": ts,
        "shopDomain": SHOP,
        "consent": {"marketing": true, "analytics": true},
        "data": {"orderId": "gid://shopify/Order/2", "value": 5.0, "currency": "USD"},
    });
    let body = json!({"events": [event.clone(), event], "timestamp": ts}).to_string();

    let (status, json, _) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    // The validator accepts both; dedup happens in the worker.
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["accepted_count"], 2);

    let (deps, receipts, _) = worker_deps(&harness);
    let report = run_once(&deps).await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(
        receipts
            .purchase_receipt_count(harness.shop_id, "gid://shopify/Order/2")
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn same_batch_twice_dedups_across_requests() {
    let harness = harness(|_| {}).await;
    let ts = now_ms();
    let body = purchase_batch(ts, "gid://shopify/Order/3");

    for _ in 0..2 {
        let (status, _, _) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (deps, receipts, _) = worker_deps(&harness);
    let report = run_once(&deps).await.unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(report.receipts_written, 1);
    assert_eq!(
        receipts
            .purchase_receipt_count(harness.shop_id, "gid://shopify/Order/3")
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn previous_secret_still_accepts_within_grace() {
    let harness = harness(|_| {}).await;
    let ts = now_ms();
    let body = purchase_batch(ts, "gid://shopify/Order/4");

    let (status, _, _) = send(
        &harness.app,
        signed_request(&body, ts, "whsec_previous"),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let raw = harness.state.queue.claim().await.unwrap().unwrap();
    let entry: QueueEntry = serde_json::from_str(&raw).unwrap();
    assert!(entry.key_validation.matched);
    assert!(entry.key_validation.used_previous_secret);
}

#[tokio::test]
async fn stale_timestamp_is_silently_dropped() {
    let harness = harness(|_| {}).await;
    let window = harness.state.config.timestamp_window_ms;
    let stale = now_ms() - 10 * window;
    let body = purchase_batch(stale, "gid://shopify/Order/5");

    let (status, json, _) = send(&harness.app, signed_request(&body, stale, SECRET)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(json, Value::Null);
    assert_eq!(harness.state.queue.pending_len().await.unwrap(), 0);
}

#[tokio::test]
async fn window_boundary_is_inclusive() {
    let harness = harness(|_| {}).await;
    let window = harness.state.config.timestamp_window_ms;

    let at_edge = now_ms() - window + 2_000; // margin for test latency
    let body = purchase_batch(at_edge, "gid://shopify/Order/6");
    let (status, _, _) = send(&harness.app, signed_request(&body, at_edge, SECRET)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let past = now_ms() - window - 1_000;
    let body = purchase_batch(past, "gid://shopify/Order/7");
    let (status, _, _) = send(&harness.app, signed_request(&body, past, SECRET)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn wrong_signature_in_production_is_homogenized_403() {
    let harness = harness(|config| config.is_production = true).await;
    let ts = now_ms();
    let body = purchase_batch(ts, "gid://shopify/Order/8");

    let (status, json, _) = send(
        &harness.app,
        signed_request(&body, ts, "completely-wrong-secret"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "Invalid request");
    assert!(json.get("details").is_none());
}

#[tokio::test]
async fn unsigned_request_rejected_in_production() {
    let harness = harness(|config| config.is_production = true).await;
    let ts = now_ms();
    let body = purchase_batch(ts, "gid://shopify/Order/9");

    let (status, json, _) = send(&harness.app, request_with_headers(&body, &[])).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "Invalid request");
}

#[tokio::test]
async fn rate_limit_returns_429_with_headers() {
    let harness = harness(|config| config.rate_limit_max = 1).await;
    let ts = now_ms();
    let body = purchase_batch(ts, "gid://shopify/Order/10");

    let (status, _, _) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, json, headers) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["error"], "Too Many Requests");
    assert!(headers.contains_key("retry-after"));
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "1");
}

#[tokio::test]
async fn shop_domain_header_mismatch_is_403_in_production() {
    let harness = harness(|config| config.is_production = true).await;
    let ts = now_ms();
    let body = purchase_batch(ts, "gid://shopify/Order/11");
    let hash = body_hash(body.as_bytes());
    let signature = compute_signature(SECRET, ts, SHOP, &hash);

    let (status, json, _) = send(
        &harness.app,
        request_with_headers(
            &body,
            &[
                ("x-tracking-guardian-signature", signature.as_str()),
                ("x-tracking-guardian-timestamp", &ts.to_string()),
                ("x-shopify-shop-domain", "b.myshopify.com"),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "Invalid request");
}

#[tokio::test]
async fn batch_size_boundary() {
    let harness = harness(|config| config.max_batch_size = 3).await;
    let ts = now_ms();

    let event = |n: usize| {
        json!({
            "eventName": "checkout_completed",
            "timestamp": ts,
            "shopDomain": SHOP,
            "data": {"orderId": format!("gid://shopify/Order/{n}")},
        })
    };

    let exact: Vec<Value> = (0..3).map(event).collect();
    let body = json!({"events": exact, "timestamp": ts}).to_string();
    let (status, _, _) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let over: Vec<Value> = (0..4).map(event).collect();
    let body = json!({"events": over, "timestamp": ts}).to_string();
    let (status, _, _) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn first_event_invalid_rejects_whole_batch() {
    let harness = harness(|_| {}).await;
    let ts = now_ms();
    let bad = json!({"eventName": "not_a_real_event", "timestamp": ts, "shopDomain": SHOP});
    let good = json!({
        "eventName": "checkout_completed",
        "timestamp": ts,
        "shopDomain": SHOP,
        "data": {"orderId": "gid://shopify/Order/12"},
    });

    let body = json!({"events": [bad.clone(), good.clone()], "timestamp": ts}).to_string();
    let (status, json_body, _) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body["error"], "First event failed validation");

    // Second-event-invalid: first processed, second skipped.
    let body = json!({"events": [good, bad], "timestamp": ts}).to_string();
    let (status, json_body, _) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json_body["accepted_count"], 1);
}

#[tokio::test]
async fn oversized_body_is_413() {
    let harness = harness(|config| config.max_body_bytes = 512).await;
    let ts = now_ms();
    let padding = "x".repeat(2_000);
    let body = json!({
        "events": [{
            "eventName": "page_viewed",
            "timestamp": ts,
            "shopDomain": SHOP,
            "data": {"pageUrl": padding},
        }],
    })
    .to_string();

    let (status, json, _) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["maxSize"], 512);
}

#[tokio::test]
async fn wrong_content_type_is_415() {
    let harness = harness(|_| {}).await;
    let ts = now_ms();
    let body = purchase_batch(ts, "gid://shopify/Order/13");
    let hash = body_hash(body.as_bytes());
    let signature = compute_signature(SECRET, ts, SHOP, &hash);

    let mut request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("origin", format!("https://{SHOP}"))
        .header("x-tracking-guardian-signature", signature)
        .header("x-tracking-guardian-timestamp", ts.to_string())
        .body(Body::from(body))
        .unwrap();
    let remote: SocketAddr = "203.0.113.9:443".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(remote));

    let (status, _, _) = send(&harness.app, request).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn unknown_origin_unsigned_rejected_in_production() {
    let harness = harness(|config| config.is_production = true).await;
    let ts = now_ms();
    let body = purchase_batch(ts, "gid://shopify/Order/14");

    let mut request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json")
        .header("origin", "https://evil.example.com")
        .header("x-tracking-guardian-timestamp", ts.to_string())
        .body(Body::from(body.clone()))
        .unwrap();
    let remote: SocketAddr = "203.0.113.9:443".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(remote));
    let (status, _, _) = send(&harness.app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Signed from the shop's canonical domain: accepted.
    let (status, _, _) = send(&harness.app, signed_request(&body, ts, SECRET)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn body_envelope_signature_works_outside_production() {
    let harness = harness(|_| {}).await;
    let ts = now_ms();

    let bare = json!({
        "events": [{
            "eventName": "checkout_completed",
            "timestamp": ts,
            "shopDomain": SHOP,
            "consent": {"marketing": true, "analytics": true},
            "data": {"orderId": "gid://shopify/Order/15"},
        }],
        "timestamp": ts,
    });
    // Sign over the canonical envelope (carrier fields removed).
    let hash = guardian_backend::auth::hmac::canonical_body_hash(&bare);
    let signature = compute_signature(SECRET, ts, SHOP, &hash);

    let mut envelope = bare.clone();
    let map = envelope.as_object_mut().unwrap();
    map.insert("signature".to_string(), json!(signature));
    map.insert("signatureTimestamp".to_string(), json!(ts));
    map.insert("signatureShopDomain".to_string(), json!(SHOP));

    let (status, json_body, _) = send(
        &harness.app,
        request_with_headers(&envelope.to_string(), &[]),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json_body["accepted_count"], 1);

    let raw = harness.state.queue.claim().await.unwrap().unwrap();
    let entry: QueueEntry = serde_json::from_str(&raw).unwrap();
    assert!(entry.key_validation.matched);
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let harness = harness(|_| {}).await;
    let mut request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let remote: SocketAddr = "203.0.113.9:443".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(remote));

    let (status, json, _) = send(&harness.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}
