//! Redis-backed implementation of the shared store.
//!
//! Uses a `ConnectionManager` so connections self-heal across restarts of
//! the redis server. All operations map 1:1 onto redis commands; atomicity
//! comes from redis itself (INCR, SET NX PX, RPOPLPUSH, LREM).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::kv::{CounterSample, KvStore};

pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client
            .get_tokio_connection_manager()
            .await
            .context("redis connect")?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<CounterSample> {
        let mut conn = self.manager.clone();
        let ttl_ms = ttl.as_millis() as i64;

        let (count, pttl): (u64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("redis INCR")?;

        // A counter without a TTL is a fresh window; arm it.
        let reset_ms = if pttl < 0 {
            let _: bool = conn.pexpire(key, ttl_ms as usize).await.context("redis PEXPIRE")?;
            ttl_ms
        } else {
            pttl
        };

        Ok(CounterSample { count, reset_ms })
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .context("redis SET NX")?;
        Ok(outcome.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await.context("redis GET")?;
        Ok(value)
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let len: u64 = conn.lpush(key, value).await.context("redis LPUSH")?;
        Ok(len)
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .ltrim(key, start as isize, stop as isize)
            .await
            .context("redis LTRIM")?;
        Ok(())
    }

    async fn list_rotate(&self, source: &str, dest: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let moved: Option<String> = conn
            .rpoplpush(source, dest)
            .await
            .context("redis RPOPLPUSH")?;
        Ok(moved)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let removed: u64 = conn.lrem(key, 0, value).await.context("redis LREM")?;
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let len: u64 = conn.llen(key).await.context("redis LLEN")?;
        Ok(len)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let values: Vec<String> = conn
            .lrange(key, start as isize, stop as isize)
            .await
            .context("redis LRANGE")?;
        Ok(values)
    }
}
