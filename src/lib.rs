//! Tollgate - Persisted Per-Identity Rate Limiting
//!
//! This crate implements a token-bucket rate limiter keyed by opaque
//! identities (peer keys, account addresses). Consumption is checkpointed to
//! a durable key-value store so budgets survive restarts, and abusive
//! identities can be temporarily blacklisted.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, TollgateError};
pub use ratelimit::{LimitConfig, PersistedRateLimiter};
pub use store::{FileStore, KvStore, MemoryStore};
