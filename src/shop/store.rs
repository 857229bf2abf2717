//! Shop persistence.
//!
//! Shops are keyed by `(shop_domain, environment)`. Secrets are decrypted
//! at load time and expired secondary secrets are nulled before the shop is
//! handed to the HMAC validator.

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::warn;

use super::{PixelConfig, Shop};
use crate::auth::secrets::SecretCipher;
use crate::models::{now_ms, Environment};

/// Seed shape used by admin tooling and tests.
#[derive(Debug, Clone, Default)]
pub struct NewShop {
    pub shop_domain: String,
    pub environment: Option<Environment>,
    pub is_active: bool,
    pub current_secret: Option<String>,
    pub previous_secret: Option<String>,
    pub previous_secret_expires_at: Option<i64>,
    pub pending_secret: Option<String>,
    pub pending_secret_expires_at: Option<i64>,
    pub primary_domain: Option<String>,
    pub storefront_domains: Vec<String>,
}

#[derive(Clone)]
pub struct ShopStore {
    conn: Arc<Mutex<Connection>>,
    cipher: SecretCipher,
}

impl ShopStore {
    pub fn new(db_path: &str, cipher: SecretCipher) -> Result<Self> {
        let conn = Connection::open(db_path).context("open shop db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cipher,
        })
    }

    pub fn open_in_memory(cipher: SecretCipher) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory shop db")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cipher,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS shops (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                shop_domain TEXT NOT NULL,
                environment TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                current_secret TEXT,
                previous_secret TEXT,
                previous_secret_expires_at INTEGER,
                pending_secret TEXT,
                pending_secret_expires_at INTEGER,
                pending_match_count INTEGER NOT NULL DEFAULT 0,
                primary_domain TEXT,
                storefront_domains TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                UNIQUE(shop_domain, environment)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pixel_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                shop_id INTEGER NOT NULL,
                platform TEXT NOT NULL,
                platform_id TEXT,
                client_side_enabled INTEGER NOT NULL DEFAULT 0,
                server_side_enabled INTEGER NOT NULL DEFAULT 0,
                client_config TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pixel_configs_shop ON pixel_configs(shop_id)",
            [],
        )?;
        Ok(())
    }

    /// Load a shop with its pixel configs, decrypting secrets in place and
    /// expiring stale secondary secrets.
    pub async fn load_shop(
        &self,
        shop_domain: &str,
        environment: Environment,
    ) -> Result<Option<Shop>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT id, shop_domain, is_active, current_secret, previous_secret,
                    previous_secret_expires_at, pending_secret, pending_secret_expires_at,
                    pending_match_count, primary_domain, storefront_domains
             FROM shops WHERE shop_domain = ?1 AND environment = ?2",
        )?;

        let row = stmt
            .query_row(params![shop_domain, environment.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                ))
            })
            .optional()?;

        let Some((
            id,
            shop_domain,
            is_active,
            current_secret,
            previous_secret,
            previous_secret_expires_at,
            pending_secret,
            pending_secret_expires_at,
            pending_match_count,
            primary_domain,
            storefront_domains,
        )) = row
        else {
            return Ok(None);
        };

        let mut cfg_stmt = conn.prepare_cached(
            "SELECT id, platform, platform_id, client_side_enabled, server_side_enabled,
                    client_config
             FROM pixel_configs WHERE shop_id = ?1 ORDER BY id ASC",
        )?;
        let pixel_configs = cfg_stmt
            .query_map(params![id], |row| {
                let client_config: String = row.get(5)?;
                Ok(PixelConfig {
                    id: row.get(0)?,
                    platform: row.get(1)?,
                    platform_id: row.get(2)?,
                    client_side_enabled: row.get::<_, i64>(3)? != 0,
                    server_side_enabled: row.get::<_, i64>(4)? != 0,
                    client_config: serde_json::from_str(&client_config)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut shop = Shop {
            id,
            shop_domain,
            is_active: is_active != 0,
            current_secret: self.decrypt_optional(current_secret, "current"),
            previous_secret: self.decrypt_optional(previous_secret, "previous"),
            previous_secret_expires_at,
            pending_secret: self.decrypt_optional(pending_secret, "pending"),
            pending_secret_expires_at,
            pending_match_count,
            primary_domain,
            storefront_domains: serde_json::from_str(&storefront_domains).unwrap_or_default(),
            pixel_configs,
        };
        shop.expire_secondary_secrets(now_ms());
        Ok(Some(shop))
    }

    fn decrypt_optional(&self, stored: Option<String>, slot: &str) -> Option<String> {
        let stored = stored?;
        match self.cipher.decrypt(&stored) {
            Ok(secret) => Some(secret),
            Err(error) => {
                // An undecryptable secret is treated as absent; the request
                // then fails with secret_missing rather than a 500.
                warn!(slot, error = %error, "Failed to decrypt shop secret");
                None
            }
        }
    }

    pub async fn increment_pending_match(&self, shop_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE shops SET pending_match_count = pending_match_count + 1 WHERE id = ?1",
            params![shop_id],
        )?;
        Ok(())
    }

    pub async fn create_shop(&self, new_shop: &NewShop) -> Result<i64> {
        let environment = new_shop.environment.unwrap_or(Environment::Test);
        let storefront_domains = serde_json::to_string(&new_shop.storefront_domains)?;
        let current = self.encrypt_optional(new_shop.current_secret.as_deref())?;
        let previous = self.encrypt_optional(new_shop.previous_secret.as_deref())?;
        let pending = self.encrypt_optional(new_shop.pending_secret.as_deref())?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO shops
             (shop_domain, environment, is_active, current_secret, previous_secret,
              previous_secret_expires_at, pending_secret, pending_secret_expires_at,
              pending_match_count, primary_domain, storefront_domains, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11)
             ON CONFLICT(shop_domain, environment) DO UPDATE SET
                is_active = excluded.is_active,
                current_secret = excluded.current_secret,
                previous_secret = excluded.previous_secret,
                previous_secret_expires_at = excluded.previous_secret_expires_at,
                pending_secret = excluded.pending_secret,
                pending_secret_expires_at = excluded.pending_secret_expires_at,
                primary_domain = excluded.primary_domain,
                storefront_domains = excluded.storefront_domains",
            params![
                &new_shop.shop_domain,
                environment.as_str(),
                new_shop.is_active as i64,
                current,
                previous,
                new_shop.previous_secret_expires_at,
                pending,
                new_shop.pending_secret_expires_at,
                new_shop.primary_domain.as_deref(),
                storefront_domains,
                now_ms(),
            ],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM shops WHERE shop_domain = ?1 AND environment = ?2",
            params![&new_shop.shop_domain, environment.as_str()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn encrypt_optional(&self, secret: Option<&str>) -> Result<Option<String>> {
        secret.map(|s| self.cipher.encrypt(s)).transpose()
    }

    pub async fn add_pixel_config(
        &self,
        shop_id: i64,
        platform: &str,
        server_side_enabled: bool,
        client_config: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pixel_configs
             (shop_id, platform, platform_id, client_side_enabled, server_side_enabled, client_config)
             VALUES (?1, ?2, NULL, 1, ?3, ?4)",
            params![
                shop_id,
                platform,
                server_side_enabled as i64,
                serde_json::to_string(client_config)?
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn pending_match_count(&self, shop_id: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT pending_match_count FROM shops WHERE id = ?1",
            params![shop_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
