//! Queue drain worker.
//!
//! Invoked by the external scheduler (cron), or run with `--follow` to
//! keep polling. Each run drains up to a bounded number of queue entries,
//! re-runs the processing stages, and acks what it finished. Entries that
//! fail stay in `ingest:processing` for recovery.
//!
//! Usage:
//!   cargo run --bin guardian-worker              # one drain run
//!   cargo run --bin guardian-worker -- --follow  # poll continuously

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use guardian_backend::models::Config;
use guardian_backend::store::kv::{KvStore, MemoryKv};
use guardian_backend::store::redis_kv::RedisKv;
use guardian_backend::worker::{run_once, WorkerDeps};

#[derive(Parser, Debug)]
#[command(name = "guardian-worker")]
#[command(about = "Drain the ingest queue and persist processed events")]
struct Args {
    /// Override the per-run entry cap from the environment
    #[arg(long)]
    max_batches: Option<usize>,

    /// Keep polling instead of exiting after one drain
    #[arg(long)]
    follow: bool,

    /// Poll interval in seconds when following
    #[arg(long, default_value_t = 5)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guardian_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(max_batches) = args.max_batches {
        config.max_batches_per_run = max_batches;
    }

    let kv: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisKv::connect(url).await.context("redis connect")?),
        None => {
            // Without redis the worker only sees entries enqueued by a
            // server running in the same process, so this is test/dev only.
            warn!("REDIS_URL not set - worker is using an in-memory store");
            Arc::new(MemoryKv::new())
        }
    };

    let deps = WorkerDeps::from_config(config, kv)?;

    loop {
        let report = run_once(&deps).await?;
        info!(
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            poisoned = report.poisoned,
            duplicates = report.duplicates,
            replays = report.replays,
            consent_dropped = report.consent_dropped,
            receipts = report.receipts_written,
            persisted = report.events_persisted,
            "Drain run complete"
        );

        if !args.follow {
            break;
        }
        sleep(Duration::from_secs(args.interval_secs)).await;
    }

    Ok(())
}
