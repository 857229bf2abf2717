//! Shared configuration and pipeline-wide enums.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shop environment a pixel batch is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Test,
    Live,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Live => "live",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "test" => Some(Environment::Test),
            "live" => Some(Environment::Live),
            _ => None,
        }
    }
}

/// Which events a shop's pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    PurchaseOnly,
    FullFunnel,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::PurchaseOnly => "purchase_only",
            PipelineMode::FullFunnel => "full_funnel",
        }
    }
}

/// Authentication strength of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Partial,
    Untrusted,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::Partial => "partial",
            TrustLevel::Untrusted => "untrusted",
        }
    }
}

/// Where the request signature was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureSource {
    Header,
    Body,
    None,
}

/// Terminal outcome of signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValidationReason {
    HmacVerified,
    HmacInvalid,
    HmacNotVerified,
    SecretMissing,
    SignatureMissing,
    SignatureSkippedEnv,
}

/// Summary of HMAC validation carried into the queue entry. Secrets never
/// leave the validator; only the trust level and which slot matched do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValidation {
    pub matched: bool,
    pub reason: KeyValidationReason,
    pub used_previous_secret: bool,
    pub trust_level: TrustLevel,
}

impl KeyValidation {
    pub fn verified(used_previous_secret: bool) -> Self {
        Self {
            matched: true,
            reason: KeyValidationReason::HmacVerified,
            used_previous_secret,
            trust_level: TrustLevel::Trusted,
        }
    }

    pub fn skipped_env() -> Self {
        Self {
            matched: true,
            reason: KeyValidationReason::SignatureSkippedEnv,
            used_previous_secret: false,
            trust_level: TrustLevel::Partial,
        }
    }

    pub fn failed(reason: KeyValidationReason) -> Self {
        Self {
            matched: false,
            reason,
            used_previous_secret: false,
            trust_level: TrustLevel::Untrusted,
        }
    }
}

/// Application configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub redis_url: Option<String>,
    /// NODE_ENV=production enables strict mode.
    pub is_production: bool,
    /// Enforce origin allowlists even for signed requests.
    pub strict_origin: bool,
    /// Non-production only: accept unsigned batches with partial trust.
    pub allow_unsigned: bool,
    /// Fall back to the in-memory rate limiter when the shared store is down.
    pub allow_store_fallback: bool,
    /// Accept requests with a null/missing Origin header even when unsigned.
    pub allow_null_origin: bool,
    pub environment_override: Option<Environment>,
    /// Clock-skew window W, milliseconds.
    pub timestamp_window_ms: i64,
    pub max_body_bytes: usize,
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub max_batches_per_run: usize,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    /// AES-256 key for secrets at rest; absent in dev means plaintext secrets.
    pub secret_encryption_key: Option<[u8; 32]>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./guardian.db".to_string());

        let redis_url = std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty());

        let is_production = std::env::var("NODE_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);

        let environment_override = std::env::var("PIXEL_ENVIRONMENT")
            .ok()
            .and_then(|v| Environment::parse(&v));

        let secret_encryption_key = std::env::var("SECRET_ENCRYPTION_KEY")
            .ok()
            .and_then(|v| hex::decode(v.trim()).ok())
            .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok());

        Ok(Self {
            port,
            database_path,
            redis_url,
            is_production,
            strict_origin: env_flag("PIXEL_STRICT_ORIGIN", false),
            allow_unsigned: env_flag("ALLOW_UNSIGNED_PIXEL_EVENTS", false) && !is_production,
            allow_store_fallback: env_flag("ALLOW_REDIS_FALLBACK_FOR_INGEST", false),
            allow_null_origin: env_flag("PIXEL_ALLOW_NULL_ORIGIN", false),
            environment_override,
            timestamp_window_ms: env_parse("PIXEL_TIMESTAMP_WINDOW_MS", 300_000),
            max_body_bytes: env_parse("PIXEL_MAX_BODY_BYTES", 262_144),
            max_batch_size: env_parse("PIXEL_MAX_BATCH_SIZE", 50),
            max_queue_size: env_parse("PIXEL_MAX_QUEUE_SIZE", 10_000),
            max_batches_per_run: env_parse("WORKER_MAX_BATCHES_PER_RUN", 25),
            rate_limit_max: env_parse("PIXEL_RATE_LIMIT_MAX", 120),
            rate_limit_window: Duration::from_secs(env_parse(
                "PIXEL_RATE_LIMIT_WINDOW_SECS",
                60,
            )),
            secret_encryption_key,
        })
    }

    /// The environment batches resolve to when no override is configured.
    pub fn default_environment(&self) -> Environment {
        self.environment_override.unwrap_or(if self.is_production {
            Environment::Live
        } else {
            Environment::Test
        })
    }

    /// A permissive configuration for tests: non-production, in-memory friendly.
    #[doc(hidden)]
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            database_path: ":memory:".to_string(),
            redis_url: None,
            is_production: false,
            strict_origin: false,
            allow_unsigned: false,
            allow_store_fallback: true,
            allow_null_origin: false,
            environment_override: None,
            timestamp_window_ms: 300_000,
            max_body_bytes: 262_144,
            max_batch_size: 50,
            max_queue_size: 10_000,
            max_batches_per_run: 25,
            rate_limit_max: 120,
            rate_limit_window: Duration::from_secs(60),
            secret_encryption_key: None,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
