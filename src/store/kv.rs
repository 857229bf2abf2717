//! Shared key-value store abstraction.
//!
//! The ingest path needs a small set of atomic primitives from its shared
//! store: counter-increment with TTL (rate limiting), set-if-absent with
//! TTL plus read-back (nonce claims), and the list push/trim/rotate/remove
//! set (the durable queue). `MemoryKv` implements them in-process for tests
//! and for the rate-limit fallback path; `RedisKv` maps them onto redis
//! commands.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Counter state after an increment.
#[derive(Debug, Clone, Copy)]
pub struct CounterSample {
    pub count: u64,
    /// Milliseconds until the counter's window resets.
    pub reset_ms: i64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically increment `key`, starting a TTL window on first touch.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<CounterSample>;

    /// Atomic set-if-absent with TTL. Returns true when the claim is fresh.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Read a value previously written by `set_if_absent`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Push to the head of a list; returns the new length.
    async fn list_push_front(&self, key: &str, value: &str) -> Result<u64>;

    /// Keep only the inclusive range `[start, stop]` (negative indices count
    /// from the tail, redis-style).
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    /// Atomically pop the tail of `source` and push it to the head of
    /// `dest`. Returns the moved element.
    async fn list_rotate(&self, source: &str, dest: &str) -> Result<Option<String>>;

    /// Remove every element equal to `value`; returns how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<u64>;

    async fn list_len(&self, key: &str) -> Result<u64>;

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
}

struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process implementation. Single-node only; production uses `RedisKv`.
#[derive(Default)]
pub struct MemoryKv {
    counters: Mutex<HashMap<String, CounterEntry>>,
    values: Mutex<HashMap<String, ValueEntry>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn clamp_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || len == 0 {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<CounterSample> {
        let mut counters = self.counters.lock();
        let now = Instant::now();

        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: now + ttl,
        });
        if now >= entry.expires_at {
            entry.count = 0;
            entry.expires_at = now + ttl;
        }
        entry.count += 1;

        Ok(CounterSample {
            count: entry.count,
            reset_ms: entry.expires_at.saturating_duration_since(now).as_millis() as i64,
        })
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut values = self.values.lock();
        let now = Instant::now();

        if let Some(entry) = values.get(key) {
            let live = entry.expires_at.map(|at| now < at).unwrap_or(true);
            if live {
                return Ok(false);
            }
        }
        values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock();
        let now = Instant::now();
        Ok(values.get(key).and_then(|entry| {
            let live = entry.expires_at.map(|at| now < at).unwrap_or(true);
            live.then(|| entry.value.clone())
        }))
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<u64> {
        let mut lists = self.lists.lock();
        let list = lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut lists = self.lists.lock();
        if let Some(list) = lists.get_mut(key) {
            match clamp_range(list.len(), start, stop) {
                Some((from, to)) => {
                    let kept: VecDeque<String> =
                        list.iter().skip(from).take(to - from + 1).cloned().collect();
                    *list = kept;
                }
                None => list.clear(),
            }
        }
        Ok(())
    }

    async fn list_rotate(&self, source: &str, dest: &str) -> Result<Option<String>> {
        let mut lists = self.lists.lock();
        let popped = lists.get_mut(source).and_then(|list| list.pop_back());
        if let Some(value) = popped {
            lists
                .entry(dest.to_string())
                .or_default()
                .push_front(value.clone());
            return Ok(Some(value));
        }
        Ok(None)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64> {
        let mut lists = self.lists.lock();
        if let Some(list) = lists.get_mut(key) {
            let before = list.len();
            list.retain(|v| v != value);
            return Ok((before - list.len()) as u64);
        }
        Ok(0)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let lists = self.lists.lock();
        Ok(lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let lists = self.lists.lock();
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match clamp_range(list.len(), start, stop) {
            Some((from, to)) => list.iter().skip(from).take(to - from + 1).cloned().collect(),
            None => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_window_resets() {
        let kv = MemoryKv::new();
        let first = kv
            .incr_with_ttl("c", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(first.count, 1);
        let second = kv
            .incr_with_ttl("c", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(second.count, 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let after = kv
            .incr_with_ttl("c", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(after.count, 1);
    }

    #[tokio::test]
    async fn test_set_if_absent_claims_once() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_if_absent("n", "1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!kv
            .set_if_absent("n", "2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_set_if_absent_expires() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_if_absent("n", "1", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(kv
            .set_if_absent("n", "2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_fifo_rotation() {
        let kv = MemoryKv::new();
        kv.list_push_front("q", "a").await.unwrap();
        kv.list_push_front("q", "b").await.unwrap();

        // Oldest element ("a", at the tail) rotates first.
        let moved = kv.list_rotate("q", "p").await.unwrap();
        assert_eq!(moved.as_deref(), Some("a"));
        assert_eq!(kv.list_len("q").await.unwrap(), 1);
        assert_eq!(kv.list_len("p").await.unwrap(), 1);

        assert_eq!(kv.list_remove("p", "a").await.unwrap(), 1);
        assert_eq!(kv.list_len("p").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_trim_bounds_queue() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.list_push_front("q", &i.to_string()).await.unwrap();
        }
        kv.list_trim("q", 0, 2).await.unwrap();
        assert_eq!(kv.list_len("q").await.unwrap(), 3);
        // Newest entries survive at the head.
        let range = kv.list_range("q", 0, -1).await.unwrap();
        assert_eq!(range, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn test_rotate_empty_list() {
        let kv = MemoryKv::new();
        assert!(kv.list_rotate("missing", "p").await.unwrap().is_none());
    }
}
