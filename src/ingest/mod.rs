//! The HTTP ingest pipeline: an ordered chain of stages that turns a raw
//! request into a validated, authenticated, shop-bound queue entry. Each
//! stage either continues with an updated context snapshot or halts with a
//! terminal response; the first halt wins.

pub mod body;
pub mod context;
pub mod origin;
pub mod pipeline;
pub mod responses;
pub mod timestamp;
pub mod validate;

pub use context::RequestContext;
pub use pipeline::{router, AppState};
