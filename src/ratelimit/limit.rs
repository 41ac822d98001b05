//! Limit configuration and equivalence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bucket::TokenBucket;
use crate::error::{Result, TollgateError};

/// Refill `quantum` tokens every `interval`, holding at most `capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Refill period in nanoseconds
    pub interval: u64,
    /// Maximum number of tokens the bucket holds
    pub capacity: u64,
    /// Tokens added per refill period
    pub quantum: u64,
}

impl LimitConfig {
    /// Build a configuration from a refill period.
    pub fn new(interval: Duration, capacity: u64, quantum: u64) -> Self {
        Self {
            interval: u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX),
            capacity,
            quantum,
        }
    }

    /// Refill period as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval)
    }

    /// Tokens per second. Informational only; equivalence uses exact ratios.
    pub fn rate(&self) -> f64 {
        if self.interval == 0 {
            return 0.0;
        }
        1e9 * self.quantum as f64 / self.interval as f64
    }

    /// Reject configurations with a zero field.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(TollgateError::InvalidConfig("interval must be non-zero".into()));
        }
        if self.capacity == 0 {
            return Err(TollgateError::InvalidConfig("capacity must be non-zero".into()));
        }
        if self.quantum == 0 {
            return Err(TollgateError::InvalidConfig("quantum must be non-zero".into()));
        }
        Ok(())
    }

    /// Whether `bucket` already enforces this configuration: same capacity and
    /// the same `quantum / interval` ratio.
    pub fn equivalent(&self, bucket: &TokenBucket) -> bool {
        self.same_limit(bucket.config())
    }

    /// Ratio-aware comparison of two configurations.
    pub fn same_limit(&self, other: &LimitConfig) -> bool {
        self.capacity == other.capacity
            && u128::from(self.quantum) * u128::from(other.interval)
                == u128::from(other.quantum) * u128::from(self.interval)
    }
}
