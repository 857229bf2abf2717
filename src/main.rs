//! Tracking Guardian ingest server.
//! Mission: accept signed pixel batches at the edge, reject abuse early,
//! and never lose an accepted event between the socket and the queue.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use tokio::net::TcpListener;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use guardian_backend::auth::SecretCipher;
use guardian_backend::ingest::{router, AppState};
use guardian_backend::middleware::logging::request_logging;
use guardian_backend::models::Config;
use guardian_backend::shop::ShopStore;
use guardian_backend::store::kv::{KvStore, MemoryKv};
use guardian_backend::store::redis_kv::RedisKv;
use guardian_backend::worker::{self, WorkerDeps};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!(
        production = config.is_production,
        environment = config.default_environment().as_str(),
        window_ms = config.timestamp_window_ms,
        "Starting ingest server"
    );

    let cipher = SecretCipher::new(config.secret_encryption_key);
    let shops = ShopStore::new(&config.database_path, cipher)
        .context("open shop store")?;

    let kv = connect_shared_store(&config).await?;
    let state = AppState::new(config.clone(), shops, kv.clone());

    spawn_limiter_cleanup(&state);
    maybe_spawn_embedded_worker(&config, kv.clone())?;

    let app = router(state).layer(axum_mw::from_fn(request_logging));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 Ingest server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

/// Redis when configured; otherwise the in-memory store, which is only
/// valid for a single instance.
async fn connect_shared_store(config: &Config) -> Result<Arc<dyn KvStore>> {
    match &config.redis_url {
        Some(url) => match RedisKv::connect(url).await {
            Ok(kv) => {
                info!("🔗 Shared store connected");
                Ok(Arc::new(kv))
            }
            Err(error) if !config.is_production => {
                warn!(error = %error, "Redis unreachable - falling back to in-memory store");
                Ok(Arc::new(MemoryKv::new()))
            }
            Err(error) => Err(error),
        },
        None => {
            warn!("REDIS_URL not set - using in-memory store (single instance only)");
            Ok(Arc::new(MemoryKv::new()))
        }
    }
}

/// Prune stale local rate-limit windows in the background.
fn spawn_limiter_cleanup(state: &AppState) {
    let pre = state.pre_limiter.clone();
    let shop = state.shop_limiter.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            pre.cleanup();
            shop.cleanup();
        }
    });
}

/// Single-instance deployments can run the drain loop in-process instead
/// of wiring up the external scheduler.
fn maybe_spawn_embedded_worker(config: &Config, kv: Arc<dyn KvStore>) -> Result<()> {
    let embedded = std::env::var("WORKER_EMBEDDED")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(false);
    if !embedded {
        return Ok(());
    }

    let deps = WorkerDeps::from_config(config.clone(), kv).context("wire embedded worker")?;
    info!("⚙️  Embedded worker enabled (10s interval)");
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            match worker::run_once(&deps).await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        completed = report.completed,
                        failed = report.failed,
                        persisted = report.events_persisted,
                        "Embedded worker drained queue"
                    );
                }
                Ok(_) => {}
                Err(error) => warn!(error = %error, "Embedded worker run failed"),
            }
        }
    });
    Ok(())
}

/// Initialize tracing with env-filter control.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guardian_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
