//! Token bucket implementation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::limit::LimitConfig;
use crate::clock::Clock;

/// A token bucket holding up to `capacity` tokens, refilled by `quantum`
/// tokens at every `interval` boundary since the bucket was created.
///
/// All accounting goes through a small internal mutex, so one bucket can be
/// shared by any number of callers.
pub struct TokenBucket {
    /// Configuration the bucket was built from
    config: LimitConfig,
    /// Time source for refills
    clock: Arc<dyn Clock>,
    /// Creation time; refill ticks are counted from here
    start: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    available: u64,
    /// Number of whole intervals since `start` already credited
    latest_tick: u64,
}

impl TokenBucket {
    /// Create a full bucket. `config` is expected to have passed
    /// [`LimitConfig::validate`].
    pub fn new(config: LimitConfig, clock: Arc<dyn Clock>) -> Self {
        let start = clock.now();
        Self {
            config,
            clock,
            start,
            state: Mutex::new(BucketState {
                available: config.capacity,
                latest_tick: 0,
            }),
        }
    }

    /// Refill, then debit up to `count` tokens. Returns the amount debited.
    pub fn take_available(&self, count: u64) -> u64 {
        if count == 0 {
            return 0;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);

        let taken = count.min(state.available);
        state.available -= taken;
        taken
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.available
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    /// Tokens missing from a full bucket.
    pub fn consumed(&self) -> u64 {
        self.capacity() - self.available()
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.config.rate()
    }

    /// The configuration this bucket enforces.
    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    fn refill(&self, state: &mut BucketState) {
        // A clock running behind the creation time credits nothing.
        let Some(elapsed) = self.clock.now().checked_sub(self.start) else {
            return;
        };
        let interval = u128::from(self.config.interval.max(1));
        let tick = u64::try_from(elapsed.as_nanos() / interval).unwrap_or(u64::MAX);
        if tick <= state.latest_tick {
            return;
        }

        if state.available < self.config.capacity {
            let refill = (tick - state.latest_tick).saturating_mul(self.config.quantum);
            state.available = state
                .available
                .saturating_add(refill)
                .min(self.config.capacity);
        }
        state.latest_tick = tick;
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("config", &self.config)
            .field("start", &self.start)
            .field("state", &*self.state.lock())
            .finish()
    }
}
