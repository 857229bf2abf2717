//! Batch abuse heuristics.
//!
//! Runs only for batches of three or more events whose signature verified:
//! a compromised or misbehaving pixel with a valid secret still shows up as
//! a skewed batch shape. In strict production mode an anomalous batch is
//! rejected; otherwise it is recorded and allowed through.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::events::{EventName, ValidatedEvent};

pub const MIN_EVENTS_FOR_HEURISTICS: usize = 3;
pub const DUPLICATE_ORDER_KEY_THRESHOLD: f64 = 0.8;
pub const INVALID_ORDER_KEY_THRESHOLD: f64 = 0.3;
pub const NON_STANDARD_EVENT_THRESHOLD: f64 = 0.5;

const MAX_ORDER_KEY_LEN: usize = 256;

lazy_static! {
    static ref GID_RE: Regex = Regex::new(r"^gid://shopify/\w+/\d+$").unwrap();
    static ref KEY_RE: Regex = Regex::new(r"^[A-Za-z0-9_.:/-]+$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbuseStats {
    pub duplicate_order_key_rate: f64,
    pub invalid_order_key_rate: f64,
    pub non_standard_event_rate: f64,
}

impl AbuseStats {
    pub fn is_anomalous(&self) -> bool {
        self.duplicate_order_key_rate > DUPLICATE_ORDER_KEY_THRESHOLD
            || self.invalid_order_key_rate > INVALID_ORDER_KEY_THRESHOLD
            || self.non_standard_event_rate > NON_STANDARD_EVENT_THRESHOLD
    }
}

fn is_valid_order_key(key: &str) -> bool {
    key.len() <= MAX_ORDER_KEY_LEN && (GID_RE.is_match(key) || KEY_RE.is_match(key))
}

fn raw_event_name(raw: &Value) -> Option<&str> {
    raw.get("eventName")
        .or_else(|| raw.get("event_name"))
        .and_then(|v| v.as_str())
}

/// Analyze a batch. Returns `None` for batches too small to judge.
pub fn analyze_batch(raw_events: &[Value], validated: &[ValidatedEvent]) -> Option<AbuseStats> {
    if raw_events.len() < MIN_EVENTS_FOR_HEURISTICS {
        return None;
    }

    let order_keys: Vec<&str> = validated
        .iter()
        .filter_map(|event| {
            event
                .payload
                .data
                .order_id
                .as_deref()
                .or(event.payload.data.checkout_token.as_deref())
        })
        .collect();

    let (duplicate_order_key_rate, invalid_order_key_rate) = if order_keys.is_empty() {
        (0.0, 0.0)
    } else {
        let total = order_keys.len() as f64;
        let unique = order_keys
            .iter()
            .collect::<std::collections::HashSet<_>>()
            .len() as f64;
        let invalid = order_keys
            .iter()
            .filter(|key| !is_valid_order_key(key))
            .count() as f64;
        (1.0 - unique / total, invalid / total)
    };

    let non_standard = raw_events
        .iter()
        .filter(|raw| {
            raw_event_name(raw)
                .and_then(EventName::parse)
                .is_none()
        })
        .count() as f64;
    let non_standard_event_rate = non_standard / raw_events.len() as f64;

    Some(AbuseStats {
        duplicate_order_key_rate,
        invalid_order_key_rate,
        non_standard_event_rate,
    })
}

/// Log an anomalous batch. Secrets and payloads stay out of the log line.
pub fn record_anomaly(shop_domain: &str, request_id: &str, stats: &AbuseStats) {
    warn!(
        shop = %shop_domain,
        request_id = %request_id,
        duplicate_rate = stats.duplicate_order_key_rate,
        invalid_rate = stats.invalid_order_key_rate,
        non_standard_rate = stats.non_standard_event_rate,
        "Batch abuse heuristics tripped"
    );
}
