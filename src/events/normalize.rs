//! Event normalization: stable dedup keys, item coercion, and the
//! deterministic event id that makes retries idempotent.

use sha2::{Digest, Sha256};
use tracing::debug;

use super::{NormalizedEvent, NormalizedItem, PixelEvent, RawItem, ValidatedEvent};
use crate::models::PipelineMode;

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Primary and secondary purchase keys.
///
/// With an order id the order id is authoritative and the checkout-token hash
/// becomes the secondary key; with only a token the token hash is primary.
/// Returns `None` when neither is present, which drops the event.
pub fn order_match_key(
    order_id: Option<&str>,
    checkout_token: Option<&str>,
) -> Option<(String, Option<String>)> {
    match (order_id, checkout_token) {
        (Some(order_id), token) => Some((
            order_id.to_string(),
            token.map(sha256_hex),
        )),
        (None, Some(token)) => Some((sha256_hex(token), None)),
        (None, None) => None,
    }
}

/// Pick the first present id variant and coerce quantity to a positive integer.
pub fn normalize_items(items: &[RawItem]) -> Vec<NormalizedItem> {
    items
        .iter()
        .filter_map(|item| {
            let id = item
                .variant_id
                .as_deref()
                .or(item.product_id.as_deref())
                .or(item.id.as_deref())
                .map(str::trim)
                .filter(|id| !id.is_empty())?;

            let quantity = item
                .quantity
                .filter(|q| q.is_finite() && *q >= 1.0)
                .map(|q| q.floor() as u32)
                .unwrap_or(1);

            Some(NormalizedItem {
                id: id.to_string(),
                name: item.name.clone(),
                price: item.price,
                quantity,
            })
        })
        .collect()
}

fn deterministic_event_id(
    event_identifier: Option<&str>,
    event_type: &str,
    shop_domain: &str,
    checkout_token: Option<&str>,
    items: &[NormalizedItem],
    nonce: Option<&str>,
) -> String {
    let items_part: String = items
        .iter()
        .map(|item| format!("{}x{}", item.id, item.quantity))
        .collect::<Vec<_>>()
        .join(",");

    let material = format!(
        "{}|{}|{}|{}|{}|{}",
        event_identifier.unwrap_or(""),
        event_type,
        shop_domain,
        checkout_token.unwrap_or(""),
        items_part,
        nonce.unwrap_or(""),
    );
    sha256_hex(&material)
}

/// Normalize a single validated event, or drop it when it is not a primary
/// event for the shop's mode or a purchase lacks both order keys.
pub fn normalize_event(
    event: PixelEvent,
    index: usize,
    mode: PipelineMode,
) -> Option<NormalizedEvent> {
    if !event.event_name.is_primary_event(mode) {
        debug!(
            event = event.event_name.as_str(),
            mode = mode.as_str(),
            "Dropping non-primary event"
        );
        return None;
    }

    let event_type = event.event_name.event_type().to_string();
    let items = normalize_items(event.data.items.as_deref().unwrap_or(&[]));

    let (order_key, alt_order_key, event_identifier) = if event.event_name.is_purchase() {
        let (order_key, alt) = order_match_key(
            event.data.order_id.as_deref(),
            event.data.checkout_token.as_deref(),
        )?;
        let identifier = format!("purchase:{}", order_key);
        (order_key, alt, Some(identifier))
    } else {
        match event.data.checkout_token.as_deref() {
            Some(token) => {
                let token_hash = sha256_hex(token);
                let identifier = format!("{}:{}", event.event_name.as_str(), token_hash);
                (format!("checkout_{}", token_hash), None, Some(identifier))
            }
            None => {
                let key = format!(
                    "session_{}_{}",
                    event.timestamp,
                    event.shop_domain.replace('.', "_")
                );
                (key, None, None)
            }
        }
    };

    let event_id = deterministic_event_id(
        event_identifier.as_deref(),
        &event_type,
        &event.shop_domain,
        event.data.checkout_token.as_deref(),
        &items,
        event.nonce.as_deref(),
    );

    Some(NormalizedEvent {
        payload: event,
        index,
        event_type,
        order_key,
        alt_order_key,
        event_identifier,
        event_id,
        items,
    })
}

/// Normalize a batch in index order, dropping non-primary events and
/// purchases without a usable order key.
pub fn normalize_events(events: Vec<ValidatedEvent>, mode: PipelineMode) -> Vec<NormalizedEvent> {
    events
        .into_iter()
        .filter_map(|event| normalize_event(event.payload, event.index, mode))
        .collect()
}
