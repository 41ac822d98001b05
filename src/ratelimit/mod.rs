//! Token buckets, the identity registry, bans and the persisted limiter.

mod blacklist;
mod bucket;
mod limit;
mod limiter;
mod registry;

pub use blacklist::BlacklistManager;
pub use bucket::TokenBucket;
pub use limit::LimitConfig;
pub use limiter::PersistedRateLimiter;
pub use registry::{BucketRegistry, Reconfigured};
