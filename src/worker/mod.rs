//! Queue drain worker.
//!
//! An independent consumer of the durable queue: claims one entry at a
//! time into the in-flight list, re-runs the processing stages, hands the
//! survivors to the persister, and acks. A failure before ack leaves the
//! entry in `ingest:processing` for recovery; redelivery is safe because
//! dedup and receipts are idempotent. Poison entries (unparseable JSON)
//! are acked and counted so they cannot wedge the queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::consent::apply_consent;
use crate::events::dedup::dedup_events;
use crate::events::normalize::normalize_events;
use crate::events::ProcessedEvent;
use crate::models::{now_ms, Config, Environment};
use crate::queue::{DurableQueue, QueueEntry, RequestMeta};
use crate::store::kv::KvStore;
use crate::store::nonce::{NonceStore, DEFAULT_NONCE_TTL};
use crate::store::receipts::{NewReceipt, ReceiptStore};

/// Wall-clock budget for one invocation; the scheduler calls again soon.
const RUN_BUDGET: Duration = Duration::from_secs(25);

/// Downstream seam: whatever persists processed events and schedules
/// dispatch jobs. The real dispatcher lives outside this crate.
#[async_trait]
pub trait EventPersister: Send + Sync {
    async fn persist_events(
        &self,
        shop_id: i64,
        events: &[ProcessedEvent],
        request_context: &RequestMeta,
        environment: Environment,
    ) -> Result<()>;
}

/// Default persister: a durable `internal_events` table, idempotent on
/// `(shop_id, event_id)`.
pub struct SqliteEventPersister {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventPersister {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open internal events db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory events db")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS internal_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                shop_id INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_name TEXT NOT NULL,
                shop_domain TEXT NOT NULL,
                destinations TEXT NOT NULL,
                environment TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                page_url TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE(shop_id, event_id)
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn count_for_shop(&self, shop_id: i64) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM internal_events WHERE shop_id = ?1",
            params![shop_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[async_trait]
impl EventPersister for SqliteEventPersister {
    async fn persist_events(
        &self,
        shop_id: i64,
        events: &[ProcessedEvent],
        request_context: &RequestMeta,
        environment: Environment,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        for processed in events {
            let destinations = serde_json::to_string(&processed.destinations)?;
            conn.execute(
                "INSERT INTO internal_events
                 (shop_id, event_id, event_type, event_name, shop_domain, destinations,
                  environment, client_ip, page_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(shop_id, event_id) DO NOTHING",
                params![
                    shop_id,
                    &processed.event.event_id,
                    &processed.event.event_type,
                    processed.event.payload.event_name.as_str(),
                    &processed.event.payload.shop_domain,
                    destinations,
                    environment.as_str(),
                    &request_context.ip,
                    request_context.page_url.as_deref(),
                    now_ms(),
                ],
            )?;
        }
        Ok(())
    }
}

pub struct WorkerDeps {
    pub config: Arc<Config>,
    pub queue: Arc<DurableQueue>,
    pub receipts: Arc<ReceiptStore>,
    pub nonces: Arc<NonceStore>,
    pub persister: Arc<dyn EventPersister>,
}

impl WorkerDeps {
    /// Wire the worker against the same stores the server uses.
    pub fn from_config(config: Config, kv: Arc<dyn KvStore>) -> Result<Self> {
        let receipts = ReceiptStore::new(&config.database_path)?;
        let persister = SqliteEventPersister::new(&config.database_path)?;
        let queue = DurableQueue::new(kv.clone(), config.max_queue_size);
        Ok(Self {
            config: Arc::new(config),
            queue: Arc::new(queue),
            receipts: Arc::new(receipts),
            nonces: Arc::new(NonceStore::new(kv, DEFAULT_NONCE_TTL)),
            persister: Arc::new(persister),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub poisoned: usize,
    pub stale_events: usize,
    pub duplicates: usize,
    pub replays: usize,
    pub consent_dropped: usize,
    pub receipts_written: usize,
    pub events_persisted: usize,
}

impl WorkerReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// One scheduler invocation: drain up to `max_batches_per_run` entries
/// within the wall-clock budget.
pub async fn run_once(deps: &WorkerDeps) -> Result<WorkerReport> {
    let run_id = Uuid::new_v4();
    let started = Instant::now();
    let mut report = WorkerReport::default();

    for _ in 0..deps.config.max_batches_per_run {
        if started.elapsed() > RUN_BUDGET {
            debug!(run_id = %run_id, "Worker budget exhausted; leaving the rest for the next run");
            break;
        }

        let Some(raw) = deps.queue.claim().await? else {
            break;
        };
        report.claimed += 1;

        let entry: QueueEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(error) => {
                // Poison pill: ack so it cannot wedge the queue.
                warn!(error = %error, "Dropping unparseable queue entry");
                deps.queue.ack(&raw).await?;
                report.poisoned += 1;
                continue;
            }
        };

        match process_entry(deps, &entry, &mut report).await {
            Ok(()) => {
                deps.queue.ack(&raw).await?;
                report.completed += 1;
            }
            Err(error) => {
                // No ack: the entry stays in flight for recovery.
                warn!(
                    request_id = %entry.request_id,
                    error = %error,
                    "Entry processing failed; left in flight"
                );
                report.failed += 1;
            }
        }
    }

    if !report.is_empty() {
        info!(
            run_id = %run_id,
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            poisoned = report.poisoned,
            persisted = report.events_persisted,
            "Worker run finished"
        );
    }
    Ok(report)
}

async fn process_entry(
    deps: &WorkerDeps,
    entry: &QueueEntry,
    report: &mut WorkerReport,
) -> Result<()> {
    let now = now_ms();
    let window = deps.config.timestamp_window_ms;

    // Defensive re-filter: the entry may have aged in the queue, and a
    // malformed producer must not smuggle foreign-shop events through.
    let mut validated = Vec::with_capacity(entry.validated_events.len());
    for event in &entry.validated_events {
        if event.payload.shop_domain != entry.shop_domain {
            warn!(
                request_id = %entry.request_id,
                event_domain = %event.payload.shop_domain,
                "Dropping event bound to a different shop"
            );
            continue;
        }
        if (now - event.payload.timestamp).abs() > window {
            report.stale_events += 1;
            continue;
        }
        validated.push(event.clone());
    }

    let normalized = normalize_events(validated, entry.mode);

    let dedup = dedup_events(&deps.receipts, &deps.nonces, entry.shop_id, normalized).await?;
    report.duplicates += dedup.duplicates;
    report.replays += dedup.replays;

    let (processed, consent_dropped) = apply_consent(dedup.kept, &entry.enabled_pixel_configs);
    report.consent_dropped += consent_dropped;

    if processed.is_empty() {
        return Ok(());
    }

    // Resolved lazily, once per entry, only when a purchase needs it.
    let mut verification_run: Option<Option<String>> = None;

    for event in &processed {
        if event.event.event_type != "purchase" || event.destinations.is_empty() {
            continue;
        }
        let run_id = match &verification_run {
            Some(cached) => cached.clone(),
            None => {
                let resolved = deps
                    .receipts
                    .latest_running_verification_run(entry.shop_id)
                    .await?;
                verification_run = Some(resolved.clone());
                resolved
            }
        };
        let written = deps
            .receipts
            .record_distribution(&NewReceipt {
                shop_id: entry.shop_id,
                event_id: event.event.event_id.clone(),
                event_type: event.event.event_type.clone(),
                order_key: event.event.order_key.clone(),
                alt_order_key: event.event.alt_order_key.clone(),
                primary_platform: event.destinations[0].clone(),
                destinations: event.destinations.clone(),
                hmac_trust: entry.key_validation.trust_level,
                hmac_matched: entry.key_validation.matched,
                verification_run_id: run_id,
            })
            .await?;
        if written {
            report.receipts_written += 1;
        }
    }

    deps.persister
        .persist_events(
            entry.shop_id,
            &processed,
            &entry.request_context,
            entry.environment,
        )
        .await?;
    report.events_persisted += processed.len();

    Ok(())
}
