//! Rate limiting against the shared store, with an in-memory fallback.
//!
//! Counters live in the shared store so limits hold across instances. When
//! the store is unreachable the limiter either falls back to a local
//! fixed window (dev, or explicitly enabled) or reports the store as down
//! so the caller can return 503.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::store::kv::KvStore;

const STORE_TIMEOUT: Duration = Duration::from_millis(200);

/// Configuration for rate limiting.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        remaining: u32,
    },
    Limited {
        limit: u32,
        retry_after_secs: u64,
        reset_ms: i64,
    },
    /// Shared store down and fallback not permitted.
    StoreUnavailable,
}

struct LocalEntry {
    count: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    kv: Arc<dyn KvStore>,
    fallback_allowed: bool,
    local: Mutex<HashMap<String, LocalEntry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, kv: Arc<dyn KvStore>, fallback_allowed: bool) -> Self {
        Self {
            config,
            kv,
            fallback_allowed,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Check one key against the limit. Store failures degrade to the local
    /// window when permitted.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let sample = timeout(
            STORE_TIMEOUT,
            self.kv.incr_with_ttl(key, self.config.window),
        )
        .await;

        match sample {
            Ok(Ok(sample)) => {
                if sample.count > self.config.max_requests as u64 {
                    RateLimitDecision::Limited {
                        limit: self.config.max_requests,
                        retry_after_secs: (sample.reset_ms.max(0) as u64).div_ceil(1000),
                        reset_ms: sample.reset_ms,
                    }
                } else {
                    RateLimitDecision::Allowed {
                        remaining: self
                            .config
                            .max_requests
                            .saturating_sub(sample.count as u32),
                    }
                }
            }
            Ok(Err(error)) => {
                warn!(key = %key, error = %error, "Rate-limit store error");
                self.degraded(key)
            }
            Err(_) => {
                warn!(key = %key, "Rate-limit store timed out");
                self.degraded(key)
            }
        }
    }

    fn degraded(&self, key: &str) -> RateLimitDecision {
        if !self.fallback_allowed {
            return RateLimitDecision::StoreUnavailable;
        }
        self.check_local(key)
    }

    fn check_local(&self, key: &str) -> RateLimitDecision {
        let mut local = self.local.lock();
        let now = Instant::now();

        let entry = local.entry(key.to_string()).or_insert(LocalEntry {
            count: 0,
            window_start: now,
        });

        // Reset window if expired
        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;

        let reset_at = entry.window_start + self.config.window;
        let reset_ms = reset_at.saturating_duration_since(now).as_millis() as i64;

        if entry.count > self.config.max_requests {
            RateLimitDecision::Limited {
                limit: self.config.max_requests,
                retry_after_secs: (reset_ms.max(0) as u64).div_ceil(1000),
                reset_ms,
            }
        } else {
            RateLimitDecision::Allowed {
                remaining: self.config.max_requests - entry.count,
            }
        }
    }

    /// Periodic cleanup of stale local entries (call from a background task).
    pub fn cleanup(&self) {
        let mut local = self.local.lock();
        let now = Instant::now();
        let window = self.config.window;

        local.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

/// Pre-body key: per client IP, scoped by the claimed shop domain.
pub fn ip_shop_key(ip: &std::net::IpAddr, shop_domain_header: Option<&str>) -> String {
    format!("ip:{}:{}", ip, shop_domain_header.unwrap_or("unknown"))
}

/// Post-shop key: per resolved shop domain, scoped by client IP.
pub fn shop_ip_key(shop_domain: &str, ip: &std::net::IpAddr) -> String {
    format!("shop:{}:ip:{}", shop_domain, ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::{CounterSample, MemoryKv};
    use anyhow::anyhow;
    use async_trait::async_trait;

    /// A store that is always down.
    struct DownKv;

    #[async_trait]
    impl KvStore for DownKv {
        async fn incr_with_ttl(&self, _: &str, _: Duration) -> anyhow::Result<CounterSample> {
            Err(anyhow!("connection refused"))
        }
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> anyhow::Result<bool> {
            Err(anyhow!("connection refused"))
        }
        async fn get(&self, _: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow!("connection refused"))
        }
        async fn list_push_front(&self, _: &str, _: &str) -> anyhow::Result<u64> {
            Err(anyhow!("connection refused"))
        }
        async fn list_trim(&self, _: &str, _: i64, _: i64) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn list_rotate(&self, _: &str, _: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow!("connection refused"))
        }
        async fn list_remove(&self, _: &str, _: &str) -> anyhow::Result<u64> {
            Err(anyhow!("connection refused"))
        }
        async fn list_len(&self, _: &str) -> anyhow::Result<u64> {
            Err(anyhow!("connection refused"))
        }
        async fn list_range(&self, _: &str, _: i64, _: i64) -> anyhow::Result<Vec<String>> {
            Err(anyhow!("connection refused"))
        }
    }

    fn config(max: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: max,
            window: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_allows_under_limit() {
        let limiter = RateLimiter::new(config(10), Arc::new(MemoryKv::new()), false);
        for expected_remaining in (0..10).rev() {
            match limiter.check("ip:1.2.3.4:s").await {
                RateLimitDecision::Allowed { remaining } => {
                    assert_eq!(remaining, expected_remaining)
                }
                other => panic!("expected Allowed, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_limits_over_quota() {
        let limiter = RateLimiter::new(config(2), Arc::new(MemoryKv::new()), false);
        limiter.check("k").await;
        limiter.check("k").await;
        match limiter.check("k").await {
            RateLimitDecision::Limited {
                limit,
                retry_after_secs,
                ..
            } => {
                assert_eq!(limit, 2);
                assert!(retry_after_secs <= 60);
            }
            other => panic!("expected Limited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let limiter = RateLimiter::new(config(1), Arc::new(MemoryKv::new()), false);
        limiter.check("a").await;
        assert!(matches!(
            limiter.check("b").await,
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("a").await,
            RateLimitDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn test_store_down_without_fallback() {
        let limiter = RateLimiter::new(config(10), Arc::new(DownKv), false);
        assert_eq!(
            limiter.check("k").await,
            RateLimitDecision::StoreUnavailable
        );
    }

    #[tokio::test]
    async fn test_store_down_with_fallback_uses_local_window() {
        let limiter = RateLimiter::new(config(2), Arc::new(DownKv), true);
        assert!(matches!(
            limiter.check("k").await,
            RateLimitDecision::Allowed { .. }
        ));
        limiter.check("k").await;
        assert!(matches!(
            limiter.check("k").await,
            RateLimitDecision::Limited { .. }
        ));
    }

    #[test]
    fn test_key_shapes() {
        let ip: std::net::IpAddr = "198.51.100.7".parse().unwrap();
        assert_eq!(
            ip_shop_key(&ip, Some("s.myshopify.com")),
            "ip:198.51.100.7:s.myshopify.com"
        );
        assert_eq!(ip_shop_key(&ip, None), "ip:198.51.100.7:unknown");
        assert_eq!(
            shop_ip_key("s.myshopify.com", &ip),
            "shop:s.myshopify.com:ip:198.51.100.7"
        );
    }
}
