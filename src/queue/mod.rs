//! Durable work queue on the shared store's list primitives.
//!
//! Producers left-push onto `ingest:queue` and trim to bound it. Consumers
//! atomically rotate the tail into `ingest:processing`, which acts as the
//! in-flight list: an entry stays there until acked, so a crash between pop
//! and ack leaves it visible for recovery. At-least-once delivery; dedup
//! and idempotent receipts make redelivery safe.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::events::ValidatedEvent;
use crate::models::{Environment, KeyValidation, PipelineMode};
use crate::shop::PixelConfig;
use crate::store::kv::KvStore;

pub const QUEUE_KEY: &str = "ingest:queue";
pub const PROCESSING_KEY: &str = "ingest:processing";

const PUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Request metadata forwarded to downstream dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

/// The serialized unit of work: everything the worker needs to re-run the
/// processing stages without touching the original request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub request_id: String,
    pub shop_id: i64,
    pub shop_domain: String,
    pub environment: Environment,
    pub mode: PipelineMode,
    pub validated_events: Vec<ValidatedEvent>,
    pub key_validation: KeyValidation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub request_context: RequestMeta,
    pub enabled_pixel_configs: Vec<PixelConfig>,
}

pub struct DurableQueue {
    kv: Arc<dyn KvStore>,
    max_size: usize,
}

impl DurableQueue {
    pub fn new(kv: Arc<dyn KvStore>, max_size: usize) -> Self {
        Self { kv, max_size }
    }

    /// Serialize, push, and trim to the configured bound.
    pub async fn enqueue(&self, entry: &QueueEntry) -> Result<()> {
        let serialized = serde_json::to_string(entry).context("serialize queue entry")?;

        timeout(PUSH_TIMEOUT, async {
            self.kv.list_push_front(QUEUE_KEY, &serialized).await?;
            self.kv
                .list_trim(QUEUE_KEY, 0, self.max_size as i64 - 1)
                .await
        })
        .await
        .map_err(|_| anyhow!("queue push timed out"))??;

        Ok(())
    }

    /// Atomically move the oldest pending entry into the in-flight list.
    pub async fn claim(&self) -> Result<Option<String>> {
        self.kv.list_rotate(QUEUE_KEY, PROCESSING_KEY).await
    }

    /// Acknowledge a processed entry, removing it from the in-flight list.
    pub async fn ack(&self, raw_entry: &str) -> Result<u64> {
        self.kv.list_remove(PROCESSING_KEY, raw_entry).await
    }

    pub async fn pending_len(&self) -> Result<u64> {
        self.kv.list_len(QUEUE_KEY).await
    }

    pub async fn in_flight_len(&self) -> Result<u64> {
        self.kv.list_len(PROCESSING_KEY).await
    }

    #[cfg(test)]
    pub(crate) fn kv_for_tests(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }
}
