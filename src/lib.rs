//! Tracking Guardian ingest backend.
//!
//! Server-side ingestion path for storefront web-pixel events: signed
//! batches arrive over HTTP, run an ordered middleware chain (rate limits,
//! origin policy, validation, HMAC under key rotation), and land on a
//! durable queue. A separate worker drains the queue, deduplicates and
//! consent-filters the events, writes idempotent receipts, and hands the
//! survivors to the persister.

pub mod auth;
pub mod events;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod queue;
pub mod shop;
pub mod store;
pub mod worker;

pub use ingest::{router, AppState};
pub use models::Config;
