//! Durable receipt store.
//!
//! One receipt per `(shop_id, event_id)`, written idempotently at
//! distribution time. The purchase-key prefetch backs the second dedup
//! layer; verification runs are resolved lazily per shop.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection};
use tokio::sync::Mutex;

use crate::models::{now_ms, TrustLevel};

#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub shop_id: i64,
    pub event_id: String,
    pub event_type: String,
    pub order_key: String,
    pub alt_order_key: Option<String>,
    pub primary_platform: String,
    pub destinations: Vec<String>,
    pub hmac_trust: TrustLevel,
    pub hmac_matched: bool,
    pub verification_run_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReceiptRecord {
    pub shop_id: i64,
    pub event_id: String,
    pub event_type: String,
    pub order_key: String,
    pub alt_order_key: Option<String>,
    pub primary_platform: String,
    pub destinations: Vec<String>,
    pub hmac_trust: String,
    pub hmac_matched: bool,
    pub verification_run_id: Option<String>,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct ReceiptStore {
    conn: Arc<Mutex<Connection>>,
}

impl ReceiptStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open receipt db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory receipt db")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS receipts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                shop_id INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                order_key TEXT NOT NULL,
                alt_order_key TEXT,
                primary_platform TEXT NOT NULL,
                destinations TEXT NOT NULL,
                hmac_trust TEXT NOT NULL,
                hmac_matched INTEGER NOT NULL,
                verification_run_id TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE(shop_id, event_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_receipts_purchase_keys
             ON receipts(shop_id, event_type, order_key)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_receipts_alt_key
             ON receipts(shop_id, event_type, alt_order_key)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS verification_runs (
                id TEXT PRIMARY KEY,
                shop_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_verification_runs_shop
             ON verification_runs(shop_id, status, started_at DESC)",
            [],
        )?;
        Ok(())
    }

    /// Idempotent upsert keyed on `(shop_id, event_id)`. Returns true when a
    /// new receipt was written, false when one already existed.
    pub async fn record_distribution(&self, receipt: &NewReceipt) -> Result<bool> {
        let conn = self.conn.lock().await;
        let destinations = serde_json::to_string(&receipt.destinations)?;
        let changed = conn.execute(
            "INSERT INTO receipts
             (shop_id, event_id, event_type, order_key, alt_order_key, primary_platform,
              destinations, hmac_trust, hmac_matched, verification_run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(shop_id, event_id) DO NOTHING",
            params![
                receipt.shop_id,
                &receipt.event_id,
                &receipt.event_type,
                &receipt.order_key,
                receipt.alt_order_key.as_deref(),
                &receipt.primary_platform,
                destinations,
                receipt.hmac_trust.as_str(),
                receipt.hmac_matched as i64,
                receipt.verification_run_id.as_deref(),
                now_ms(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Purchase-dedup prefetch: every known purchase key for this shop that
    /// collides with any key in `keys`, matched against either key column,
    /// mapped to the event id that owns the receipt. The owner matters: a
    /// redelivered entry colliding with its own receipt is reprocessing,
    /// not a duplicate.
    pub async fn existing_purchase_keys(
        &self,
        shop_id: i64,
        keys: &[String],
    ) -> Result<HashMap<String, String>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock().await;

        let placeholders = keys.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT order_key, alt_order_key, event_id FROM receipts
             WHERE shop_id = ?1 AND event_type = 'purchase'
               AND (order_key IN ({placeholders}) OR alt_order_key IN ({placeholders}))"
        );

        let mut stmt = conn.prepare_cached(&sql)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&shop_id];
        for key in keys {
            bound.push(key);
        }
        for key in keys {
            bound.push(key);
        }

        let mut out = HashMap::new();
        let rows = stmt.query_map(params_from_iter(bound), |row| {
            let order_key: String = row.get(0)?;
            let alt: Option<String> = row.get(1)?;
            let event_id: String = row.get(2)?;
            Ok((order_key, alt, event_id))
        })?;
        for (order_key, alt, event_id) in rows.flatten() {
            out.insert(order_key, event_id.clone());
            if let Some(alt) = alt {
                out.insert(alt, event_id);
            }
        }
        Ok(out)
    }

    pub async fn receipt_for_event(
        &self,
        shop_id: i64,
        event_id: &str,
    ) -> Result<Option<ReceiptRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT shop_id, event_id, event_type, order_key, alt_order_key, primary_platform,
                    destinations, hmac_trust, hmac_matched, verification_run_id, created_at
             FROM receipts WHERE shop_id = ?1 AND event_id = ?2",
        )?;
        let mut rows = stmt.query(params![shop_id, event_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let destinations: String = row.get(6)?;
        Ok(Some(ReceiptRecord {
            shop_id: row.get(0)?,
            event_id: row.get(1)?,
            event_type: row.get(2)?,
            order_key: row.get(3)?,
            alt_order_key: row.get(4)?,
            primary_platform: row.get(5)?,
            destinations: serde_json::from_str(&destinations).unwrap_or_default(),
            hmac_trust: row.get(7)?,
            hmac_matched: row.get::<_, i64>(8)? != 0,
            verification_run_id: row.get(9)?,
            created_at: row.get(10)?,
        }))
    }

    pub async fn purchase_receipt_count(&self, shop_id: i64, order_key: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM receipts
             WHERE shop_id = ?1 AND event_type = 'purchase'
               AND (order_key = ?2 OR alt_order_key = ?2)",
        )?;
        let count: i64 = stmt.query_row(params![shop_id, order_key], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// The most recent running verification run for a shop, if any.
    pub async fn latest_running_verification_run(&self, shop_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM verification_runs
             WHERE shop_id = ?1 AND status = 'running'
             ORDER BY started_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![shop_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row.get(0)?))
    }

    pub async fn start_verification_run(&self, shop_id: i64, run_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO verification_runs (id, shop_id, status, started_at)
             VALUES (?1, ?2, 'running', ?3)",
            params![run_id, shop_id, now_ms()],
        )?;
        Ok(())
    }
}
