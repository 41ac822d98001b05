//! Identity to bucket registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::bucket::TokenBucket;
use super::limit::LimitConfig;
use crate::clock::Clock;
use crate::error::hex_identity;

/// Outcome of [`BucketRegistry::reconfigure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfigured {
    /// The live bucket already enforces an equivalent limit
    Unchanged,
    /// A new bucket replaced the old one (or none existed), carrying over
    /// `carried` consumed tokens
    Replaced {
        /// Tokens debited from the new bucket to match the old one
        carried: u64,
    },
}

/// Owns the single live [`TokenBucket`] of every active identity.
///
/// The map lock only covers lookups, inserts and removals. It is never held
/// while talking to the store. When both locks are needed the registry lock
/// is taken before a bucket's own lock.
pub struct BucketRegistry {
    buckets: RwLock<HashMap<Vec<u8>, Arc<TokenBucket>>>,
    clock: Arc<dyn Clock>,
}

impl BucketRegistry {
    /// Create an empty registry whose buckets read time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Return the bucket for `identity`, creating it from `config` if absent.
    ///
    /// The flag is `true` when this call created the bucket. Concurrent first
    /// access still yields exactly one bucket; `config` is ignored for an
    /// identity that already has one.
    pub fn get_or_create(&self, identity: &[u8], config: LimitConfig) -> (Arc<TokenBucket>, bool) {
        if let Some(bucket) = self.buckets.read().get(identity) {
            return (bucket.clone(), false);
        }

        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get(identity) {
            return (bucket.clone(), false);
        }

        debug!(
            identity = %hex_identity(identity),
            capacity = config.capacity,
            quantum = config.quantum,
            interval_ns = config.interval,
            "Creating token bucket"
        );
        let bucket = Arc::new(TokenBucket::new(config, self.clock.clone()));
        buckets.insert(identity.to_vec(), bucket.clone());
        (bucket, true)
    }

    /// The live bucket for `identity`, if any.
    pub fn get(&self, identity: &[u8]) -> Option<Arc<TokenBucket>> {
        self.buckets.read().get(identity).cloned()
    }

    /// Remove and return the bucket for `identity`.
    pub fn evict(&self, identity: &[u8]) -> Option<Arc<TokenBucket>> {
        self.buckets.write().remove(identity)
    }

    /// Remove the bucket for `identity` only if it is still `bucket`.
    ///
    /// Returns `true` when the entry was removed.
    pub fn evict_if(&self, identity: &[u8], bucket: &Arc<TokenBucket>) -> bool {
        let mut buckets = self.buckets.write();
        match buckets.get(identity) {
            Some(live) if Arc::ptr_eq(live, bucket) => {
                buckets.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Swap the bucket for `identity` to one built from `config`.
    ///
    /// The new bucket starts with the old bucket's consumed amount already
    /// debited. Nothing changes when the live bucket is equivalent.
    pub fn reconfigure(&self, identity: &[u8], config: LimitConfig) -> Reconfigured {
        let mut buckets = self.buckets.write();

        let carried = match buckets.get(identity) {
            Some(old) if config.equivalent(old) => return Reconfigured::Unchanged,
            Some(old) => old.consumed(),
            None => 0,
        };

        let bucket = Arc::new(TokenBucket::new(config, self.clock.clone()));
        bucket.take_available(carried);
        buckets.insert(identity.to_vec(), bucket);

        debug!(
            identity = %hex_identity(identity),
            capacity = config.capacity,
            carried,
            "Replaced token bucket"
        );
        Reconfigured::Replaced { carried }
    }

    /// Identities with a live bucket.
    pub fn identities(&self) -> Vec<Vec<u8>> {
        self.buckets.read().keys().cloned().collect()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Whether no bucket is live.
    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }
}
