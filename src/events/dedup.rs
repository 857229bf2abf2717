//! Purchase deduplication.
//!
//! Three layers, each closing a gap the others leave open: a per-batch set
//! for intra-batch duplicates, a receipt-store prefetch for previously
//! accepted batches, and an atomic nonce claim for the window between
//! prefetch and insert.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::debug;

use super::NormalizedEvent;
use crate::store::{nonce::NonceClaim, nonce::NonceStore, receipts::ReceiptStore};

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub kept: Vec<NormalizedEvent>,
    pub duplicates: usize,
    pub replays: usize,
}

/// Drop duplicate purchase events; non-purchase events pass through.
/// Events are visited in batch order so the first occurrence wins.
pub async fn dedup_events(
    receipts: &ReceiptStore,
    nonces: &NonceStore,
    shop_id: i64,
    events: Vec<NormalizedEvent>,
) -> Result<DedupOutcome> {
    let batch_keys: Vec<String> = events
        .iter()
        .filter(|event| event.is_purchase())
        .flat_map(|event| event.purchase_keys())
        .map(String::from)
        .collect();

    let existing_purchase_keys: HashMap<String, String> = if batch_keys.is_empty() {
        HashMap::new()
    } else {
        receipts.existing_purchase_keys(shop_id, &batch_keys).await?
    };

    let mut outcome = DedupOutcome::default();
    let mut seen_purchase_keys: HashSet<String> = HashSet::new();

    for event in events {
        if !event.is_purchase() {
            outcome.kept.push(event);
            continue;
        }

        let keys: Vec<String> = event.purchase_keys().iter().map(|k| k.to_string()).collect();

        // A receipt owned by a *different* event is a duplicate; a receipt
        // owned by this very event id means the entry is being redelivered.
        if keys.iter().any(|key| {
            seen_purchase_keys.contains(key)
                || existing_purchase_keys
                    .get(key)
                    .map(|owner| owner != &event.event_id)
                    .unwrap_or(false)
        }) {
            debug!(
                shop_id,
                order_key = %event.order_key,
                "Dropping duplicate purchase"
            );
            outcome.duplicates += 1;
            continue;
        }

        let claim = nonces
            .claim(
                shop_id,
                &event.event_type,
                &event.order_key,
                event.payload.nonce.as_deref(),
                &event.event_id,
            )
            .await?;
        if claim == NonceClaim::Replay {
            debug!(
                shop_id,
                order_key = %event.order_key,
                "Dropping replayed purchase"
            );
            outcome.replays += 1;
            continue;
        }

        for key in keys {
            seen_purchase_keys.insert(key);
        }
        outcome.kept.push(event);
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::normalize::normalize_event;
    use crate::events::{ConsentState, EventData, EventName, PixelEvent};
    use crate::models::PipelineMode;
    use crate::store::kv::MemoryKv;
    use crate::store::nonce::NonceStore;
    use crate::store::receipts::{NewReceipt, ReceiptStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn purchase(order_id: &str, token: Option<&str>) -> NormalizedEvent {
        let event = PixelEvent {
            event_name: EventName::CheckoutCompleted,
            timestamp: 1_700_000_000_000,
            shop_domain: "s.myshopify.com".to_string(),
            nonce: None,
            consent: Some(ConsentState::default()),
            data: EventData {
                order_id: Some(order_id.to_string()),
                checkout_token: token.map(String::from),
                ..Default::default()
            },
        };
        normalize_event(event, 0, PipelineMode::PurchaseOnly).unwrap()
    }

    fn page_view() -> NormalizedEvent {
        let event = PixelEvent {
            event_name: EventName::PageViewed,
            timestamp: 7,
            shop_domain: "s.myshopify.com".to_string(),
            nonce: None,
            consent: None,
            data: EventData::default(),
        };
        normalize_event(event, 1, PipelineMode::FullFunnel).unwrap()
    }

    fn stores() -> (ReceiptStore, NonceStore) {
        let receipts = ReceiptStore::open_in_memory().unwrap();
        let nonces = NonceStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(86_400));
        (receipts, nonces)
    }

    #[tokio::test]
    async fn test_in_batch_duplicate_first_wins() {
        let (receipts, nonces) = stores();
        let events = vec![
            purchase("gid://shopify/Order/1", None),
            purchase("gid://shopify/Order/1", None),
        ];
        let outcome = dedup_events(&receipts, &nonces, 1, events).await.unwrap();
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.replays, 0);
    }

    #[tokio::test]
    async fn test_existing_receipt_blocks_resubmission() {
        let (receipts, nonces) = stores();
        let first = purchase("gid://shopify/Order/9", Some("tok_x"));
        // Receipt owned by some earlier, different event with the same keys.
        receipts
            .record_distribution(&NewReceipt {
                shop_id: 1,
                event_id: "evt-prior".to_string(),
                event_type: "purchase".to_string(),
                order_key: first.order_key.clone(),
                alt_order_key: first.alt_order_key.clone(),
                primary_platform: "meta".to_string(),
                destinations: vec!["meta".to_string()],
                hmac_trust: crate::models::TrustLevel::Trusted,
                hmac_matched: true,
                verification_run_id: None,
            })
            .await
            .unwrap();

        let outcome = dedup_events(
            &receipts,
            &nonces,
            1,
            vec![purchase("gid://shopify/Order/9", Some("tok_x"))],
        )
        .await
        .unwrap();
        assert!(outcome.kept.is_empty());
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn test_alt_key_match_is_a_duplicate() {
        let (receipts, nonces) = stores();
        // First receipt recorded with order id + token hash as alt key.
        let first = purchase("gid://shopify/Order/5", Some("tok_shared"));
        receipts
            .record_distribution(&NewReceipt {
                shop_id: 1,
                event_id: first.event_id.clone(),
                event_type: "purchase".to_string(),
                order_key: first.order_key.clone(),
                alt_order_key: first.alt_order_key.clone(),
                primary_platform: "meta".to_string(),
                destinations: vec!["meta".to_string()],
                hmac_trust: crate::models::TrustLevel::Trusted,
                hmac_matched: true,
                verification_run_id: None,
            })
            .await
            .unwrap();

        // Token-only resubmission resolves to the alt key of the receipt.
        let event = PixelEvent {
            event_name: EventName::CheckoutCompleted,
            timestamp: 1_700_000_000_000,
            shop_domain: "s.myshopify.com".to_string(),
            nonce: None,
            consent: None,
            data: EventData {
                checkout_token: Some("tok_shared".to_string()),
                ..Default::default()
            },
        };
        let token_only = normalize_event(event, 0, PipelineMode::PurchaseOnly).unwrap();
        let outcome = dedup_events(&receipts, &nonces, 1, vec![token_only])
            .await
            .unwrap();
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn test_nonce_replay_detected_across_batches() {
        let (receipts, nonces) = stores();
        let outcome = dedup_events(&receipts, &nonces, 1, vec![purchase("gid://shopify/Order/2", None)])
            .await
            .unwrap();
        assert_eq!(outcome.kept.len(), 1);

        // A different event claiming the same order key (no receipt exists
        // yet, so the prefetch is blind to it) is caught by the nonce layer.
        let other = purchase("gid://shopify/Order/2", Some("tok_other"));
        let outcome = dedup_events(&receipts, &nonces, 1, vec![other]).await.unwrap();
        assert!(outcome.kept.is_empty());
        assert_eq!(outcome.replays, 1);
    }

    #[tokio::test]
    async fn test_redelivered_event_passes_nonce_layer() {
        let (receipts, nonces) = stores();
        let event = purchase("gid://shopify/Order/8", None);
        let outcome = dedup_events(&receipts, &nonces, 1, vec![event.clone()])
            .await
            .unwrap();
        assert_eq!(outcome.kept.len(), 1);

        // Worker crashed before the receipt was written; the redelivered
        // entry carries the identical event and must not be dropped.
        let outcome = dedup_events(&receipts, &nonces, 1, vec![event]).await.unwrap();
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.replays, 0);
    }

    #[tokio::test]
    async fn test_non_purchase_events_pass_through() {
        let (receipts, nonces) = stores();
        let outcome = dedup_events(&receipts, &nonces, 1, vec![page_view(), page_view()])
            .await
            .unwrap();
        assert_eq!(outcome.kept.len(), 2);
        assert_eq!(outcome.duplicates, 0);
    }
}
