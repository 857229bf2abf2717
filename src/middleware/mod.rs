//! Request logging and rate limiting.

pub mod logging;
pub mod rate_limit;
