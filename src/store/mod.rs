//! Storage backends: the shared key-value store (queue, nonces, rate
//! limits) and the durable sqlite receipt store.

pub mod kv;
pub mod nonce;
pub mod receipts;
pub mod redis_kv;

pub use kv::{CounterSample, KvStore, MemoryKv};
pub use nonce::{NonceClaim, NonceStore};
pub use receipts::{NewReceipt, ReceiptStore};
pub use redis_kv::RedisKv;
