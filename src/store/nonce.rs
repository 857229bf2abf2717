//! Event nonce claims.
//!
//! The last dedup layer: an atomic set-if-absent on the shared store closes
//! the race between the receipt prefetch and the receipt insert. The claim
//! key is the client-provided nonce when one exists, otherwise the order
//! key; the claim value is the deterministic event id, so redelivery of the
//! same logical event (worker crash before ack) re-enters its own claim
//! instead of being dropped as a replay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use super::kv::KvStore;

/// Claims outlive the dedup prefetch race by a wide margin.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceClaim {
    Fresh,
    Replay,
}

pub struct NonceStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl NonceStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn claim(
        &self,
        shop_id: i64,
        event_type: &str,
        order_key: &str,
        provided_nonce: Option<&str>,
        event_id: &str,
    ) -> Result<NonceClaim> {
        let key = match provided_nonce {
            Some(nonce) => format!("nonce:{shop_id}:{event_type}:n:{nonce}"),
            None => format!("nonce:{shop_id}:{event_type}:k:{order_key}"),
        };

        if self.kv.set_if_absent(&key, event_id, self.ttl).await? {
            return Ok(NonceClaim::Fresh);
        }

        // Same logical event re-claiming (redelivery after a crash) is not
        // a replay; the receipt upsert downstream is idempotent.
        let owner = self.kv.get(&key).await?;
        if owner.as_deref() == Some(event_id) {
            debug!(shop_id, order_key, "Nonce re-entered by its own event");
            return Ok(NonceClaim::Fresh);
        }
        Ok(NonceClaim::Replay)
    }
}
