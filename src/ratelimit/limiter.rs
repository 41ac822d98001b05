//! Persisted per-identity rate limiter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use super::blacklist::BlacklistManager;
use super::bucket::TokenBucket;
use super::limit::LimitConfig;
use super::registry::{BucketRegistry, Reconfigured};
use crate::clock::{Clock, SystemClock};
use crate::error::{hex_identity, Result, TollgateError};
use crate::store::{CapacitySnapshot, KvStore, RecordStore};

/// Token-bucket limiter keyed by identity, checkpointing consumption to a
/// durable store so budgets survive restarts.
///
/// This struct is thread-safe and can be shared across threads.
pub struct PersistedRateLimiter {
    records: RecordStore,
    default_config: LimitConfig,
    registry: BucketRegistry,
    blacklist: BlacklistManager,
    clock: Arc<dyn Clock>,
}

impl PersistedRateLimiter {
    /// Create a limiter persisting under `prefix` in `store`.
    pub fn new(
        store: Arc<dyn KvStore>,
        default_config: LimitConfig,
        prefix: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        Self::with_clock(store, default_config, prefix, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(
        store: Arc<dyn KvStore>,
        default_config: LimitConfig,
        prefix: impl Into<Vec<u8>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        default_config.validate()?;
        let records = RecordStore::new(store, prefix);
        Ok(Self {
            blacklist: BlacklistManager::new(records.clone(), clock.clone()),
            registry: BucketRegistry::new(clock.clone()),
            records,
            default_config,
            clock,
        })
    }

    /// The configuration used when no override applies.
    pub fn default_config(&self) -> LimitConfig {
        self.default_config
    }

    /// Register `identity`, restoring its persisted state.
    ///
    /// Fails if the identity is blacklisted or its stored override cannot be
    /// decoded. A bucket restored from a snapshot resumes exactly as consumed
    /// as it was when saved: time elapsed since the snapshot is not credited.
    pub fn create(&self, identity: &[u8]) -> Result<()> {
        self.blacklist.check(identity)?;

        let config = match self.records.load_config_override(identity)? {
            Some(config) => config,
            None => self.default_config,
        };

        let (bucket, created) = self.registry.get_or_create(identity, config);
        if !created {
            trace!(identity = %hex_identity(identity), "Identity already active");
            return Ok(());
        }

        match self.records.load_capacity_snapshot(identity) {
            Ok(Some(snapshot)) => {
                let restored = bucket.take_available(snapshot.consumed);
                debug!(
                    identity = %hex_identity(identity),
                    consumed = snapshot.consumed,
                    restored,
                    saved_at = snapshot.saved_at,
                    "Restored capacity snapshot"
                );
            }
            Ok(None) => {}
            Err(e @ TollgateError::MalformedRecord { .. }) => {
                warn!(
                    identity = %hex_identity(identity),
                    error = %e,
                    "Ignoring malformed capacity snapshot, starting at full capacity"
                );
            }
            Err(e) => {
                // Leave no half-initialized bucket behind for a failed create,
                // unless it has since been replaced.
                self.registry.evict_if(identity, &bucket);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop `identity` from memory after persisting its consumption.
    ///
    /// A non-zero `ban` blacklists the identity first; if that fails nothing
    /// else happens.
    pub fn remove(&self, identity: &[u8], ban: Duration) -> Result<()> {
        self.blacklist.ban(identity, ban)?;

        let Some(bucket) = self.registry.evict(identity) else {
            return Ok(());
        };
        self.store_snapshot(identity, &bucket)
    }

    /// Debit up to `count` tokens from `identity`, returning the amount taken.
    ///
    /// An unseen identity gets a default bucket without consulting the
    /// blacklist or overrides. The checkpoint that follows is best effort.
    pub fn take_available(&self, identity: &[u8], count: u64) -> u64 {
        let (bucket, _) = self.registry.get_or_create(identity, self.default_config);
        let taken = bucket.take_available(count);
        trace!(identity = %hex_identity(identity), count, taken, "Took tokens");

        if let Err(e) = self.store_snapshot(identity, &bucket) {
            error!(
                identity = %hex_identity(identity),
                error = %e,
                "Failed to checkpoint capacity"
            );
        }
        taken
    }

    /// Tokens currently available to `identity`.
    pub fn available(&self, identity: &[u8]) -> u64 {
        self.registry
            .get_or_create(identity, self.default_config)
            .0
            .available()
    }

    /// Switch `identity` to `config`, keeping its consumed budget.
    ///
    /// A no-op when the live bucket already enforces an equivalent limit.
    /// Nothing is persisted; see [`Self::set_config_override`].
    pub fn update_config(&self, identity: &[u8], config: LimitConfig) -> Result<()> {
        config.validate()?;
        if let Reconfigured::Replaced { carried } = self.registry.reconfigure(identity, config) {
            debug!(
                identity = %hex_identity(identity),
                capacity = config.capacity,
                carried,
                "Updated identity configuration"
            );
        }
        Ok(())
    }

    /// Persist an override consulted by the next [`Self::create`].
    pub fn set_config_override(&self, identity: &[u8], config: LimitConfig) -> Result<()> {
        config.validate()?;
        self.records.put_config_override(identity, &config)
    }

    /// Delete any persisted override for `identity`.
    pub fn clear_config_override(&self, identity: &[u8]) -> Result<()> {
        self.records.delete_config_override(identity)
    }

    /// The stored ban deadline for `identity`, if a record exists.
    pub fn blacklist_deadline(&self, identity: &[u8]) -> Result<Option<u64>> {
        self.blacklist.deadline(identity)
    }

    /// The live bucket for `identity`, without creating one.
    pub fn bucket(&self, identity: &[u8]) -> Option<Arc<TokenBucket>> {
        self.registry.get(identity)
    }

    /// Identities with a live bucket.
    pub fn active_identities(&self) -> Vec<Vec<u8>> {
        self.registry.identities()
    }

    /// Number of live buckets.
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Remove every live identity, persisting each snapshot.
    ///
    /// Every identity is attempted; the first failure is returned.
    pub fn shutdown(self) -> Result<()> {
        let mut first_error = None;
        for identity in self.registry.identities() {
            if let Err(e) = self.remove(&identity, Duration::ZERO) {
                error!(
                    identity = %hex_identity(&identity),
                    error = %e,
                    "Failed to persist capacity on shutdown"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn store_snapshot(&self, identity: &[u8], bucket: &TokenBucket) -> Result<()> {
        let snapshot = CapacitySnapshot {
            consumed: bucket.consumed(),
            saved_at: self.clock.unix_secs(),
        };
        self.records.put_capacity_snapshot(identity, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::FlakyStore;
    use crate::store::{record_key, Lookup, MemoryStore, RecordKind};

    const PREFIX: &[u8] = b"peers";

    fn one_per_second(capacity: u64) -> LimitConfig {
        LimitConfig::new(Duration::from_secs(1), capacity, 1)
    }

    fn limiter_on(
        store: Arc<dyn KvStore>,
        clock: Arc<ManualClock>,
    ) -> PersistedRateLimiter {
        PersistedRateLimiter::with_clock(store, one_per_second(10), PREFIX.to_vec(), clock)
            .unwrap()
    }

    fn setup() -> (Arc<ManualClock>, Arc<MemoryStore>, PersistedRateLimiter) {
        let clock = Arc::new(ManualClock::from_secs(1_000));
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_on(store.clone(), clock.clone());
        (clock, store, limiter)
    }

    #[test]
    fn test_rejects_invalid_default_config() {
        let store = Arc::new(MemoryStore::new());
        let result = PersistedRateLimiter::new(store, one_per_second(0), PREFIX.to_vec());
        assert!(matches!(result, Err(TollgateError::InvalidConfig(_))));
    }

    #[test]
    fn test_alice_scenario() {
        let (clock, store, limiter) = setup();

        limiter.create(b"alice").unwrap();
        assert_eq!(limiter.available(b"alice"), 10);

        assert_eq!(limiter.take_available(b"alice", 7), 7);
        assert_eq!(limiter.available(b"alice"), 3);

        assert_eq!(limiter.take_available(b"alice", 5), 3);
        assert_eq!(limiter.available(b"alice"), 0);

        limiter.remove(b"alice", Duration::ZERO).unwrap();
        assert_eq!(limiter.active_count(), 0);
        let key = record_key(RecordKind::CapacitySnapshot, PREFIX, b"alice");
        let expected = CapacitySnapshot {
            consumed: 10,
            saved_at: 1_000,
        };
        assert_eq!(store.get(&key).unwrap(), Lookup::Found(expected.encode().to_vec()));
        assert_eq!(limiter.blacklist_deadline(b"alice").unwrap(), None);

        clock.advance(Duration::from_millis(10));
        limiter.create(b"alice").unwrap();
        assert_eq!(limiter.available(b"alice"), 0);
    }

    #[test]
    fn test_bob_blacklist_scenario() {
        let (clock, _, limiter) = setup();

        limiter.remove(b"bob", Duration::from_secs(60)).unwrap();

        clock.set(Duration::from_secs(1_030));
        let err = limiter.create(b"bob").unwrap_err();
        assert!(matches!(err, TollgateError::Blacklisted { deadline: 1_060, .. }));
        assert!(limiter.bucket(b"bob").is_none());

        clock.set(Duration::from_secs(1_061));
        limiter.create(b"bob").unwrap();
        assert_eq!(limiter.available(b"bob"), 10);
        assert_eq!(limiter.blacklist_deadline(b"bob").unwrap(), None);
    }

    #[test]
    fn test_blacklist_rejects_even_when_active() {
        let (_, _, limiter) = setup();
        limiter.create(b"eve").unwrap();
        limiter.take_available(b"eve", 2);

        // A ban is written first; the live bucket is flushed and dropped.
        limiter.remove(b"eve", Duration::from_secs(30)).unwrap();
        limiter.take_available(b"eve", 1);
        assert!(limiter.bucket(b"eve").is_some());

        assert!(matches!(
            limiter.create(b"eve"),
            Err(TollgateError::Blacklisted { .. })
        ));
    }

    #[test]
    fn test_blacklist_window_boundary() {
        let (clock, _, limiter) = setup();
        limiter.remove(b"mallory", Duration::from_secs(5)).unwrap();

        clock.set(Duration::from_millis(1_004_999));
        assert!(limiter.create(b"mallory").is_err());

        clock.set(Duration::from_secs(1_005));
        assert!(limiter.create(b"mallory").is_ok());
    }

    #[test]
    fn test_ban_from_fractional_second_lasts_full_duration() {
        let (clock, _, limiter) = setup();
        clock.set(Duration::from_millis(1_000_500));
        limiter.remove(b"bob", Duration::from_secs(60)).unwrap();

        clock.set(Duration::from_millis(1_060_200));
        assert!(matches!(
            limiter.create(b"bob"),
            Err(TollgateError::Blacklisted { .. })
        ));

        clock.set(Duration::from_secs(1_061));
        limiter.create(b"bob").unwrap();
    }

    #[test]
    fn test_malformed_snapshot_fails_open() {
        let (_, store, limiter) = setup();
        let key = record_key(RecordKind::CapacitySnapshot, PREFIX, b"alice");
        store.put(&key, &[0, 0, 0, 0, 0, 0, 0, 9]).unwrap();

        limiter.create(b"alice").unwrap();
        assert_eq!(limiter.available(b"alice"), 10);
    }

    #[test]
    fn test_restore_gives_no_refill_credit() {
        let (clock, store, limiter) = setup();
        let key = record_key(RecordKind::CapacitySnapshot, PREFIX, b"alice");
        let snapshot = CapacitySnapshot {
            consumed: 6,
            saved_at: 400,
        };
        store.put(&key, &snapshot.encode()).unwrap();

        clock.set(Duration::from_secs(100_000));
        limiter.create(b"alice").unwrap();
        assert_eq!(limiter.available(b"alice"), 4);
    }

    #[test]
    fn test_restore_survives_limiter_restart() {
        let clock = Arc::new(ManualClock::from_secs(1_000));
        let store = Arc::new(MemoryStore::new());

        let first = limiter_on(store.clone(), clock.clone());
        first.create(b"alice").unwrap();
        first.take_available(b"alice", 4);
        first.shutdown().unwrap();

        let second = limiter_on(store, clock);
        second.create(b"alice").unwrap();
        assert_eq!(second.available(b"alice"), 6);
    }

    #[test]
    fn test_repeated_create_does_not_replay_snapshot() {
        let (_, _, limiter) = setup();
        limiter.create(b"alice").unwrap();
        limiter.take_available(b"alice", 3);

        limiter.create(b"alice").unwrap();
        assert_eq!(limiter.available(b"alice"), 7);
    }

    #[test]
    fn test_create_uses_stored_override() {
        let (_, _, limiter) = setup();
        limiter
            .set_config_override(b"carol", one_per_second(50))
            .unwrap();

        limiter.create(b"carol").unwrap();
        assert_eq!(limiter.available(b"carol"), 50);

        limiter.remove(b"carol", Duration::ZERO).unwrap();
        limiter.clear_config_override(b"carol").unwrap();
        limiter.create(b"carol").unwrap();
        assert_eq!(limiter.available(b"carol"), 10);
    }

    #[test]
    fn test_undecodable_override_fails_create() {
        let (_, store, limiter) = setup();
        let key = record_key(RecordKind::ConfigOverride, PREFIX, b"carol");
        store.put(&key, b"{\"interval\":").unwrap();

        assert!(matches!(
            limiter.create(b"carol"),
            Err(TollgateError::Decode { .. })
        ));
        assert!(limiter.bucket(b"carol").is_none());
    }

    #[test]
    fn test_take_available_does_not_consult_blacklist_or_override() {
        let (_, _, limiter) = setup();
        limiter
            .set_config_override(b"dave", one_per_second(50))
            .unwrap();
        limiter.remove(b"dave", Duration::from_secs(60)).unwrap();

        assert_eq!(limiter.take_available(b"dave", 20), 10);
        assert_eq!(limiter.bucket(b"dave").unwrap().capacity(), 10);
    }

    #[test]
    fn test_take_available_survives_store_outage() {
        let clock = Arc::new(ManualClock::from_secs(1_000));
        let store = Arc::new(FlakyStore::new());
        let limiter = limiter_on(store.clone(), clock);

        store.fail_writes(true);
        assert_eq!(limiter.take_available(b"alice", 4), 4);
        assert_eq!(limiter.available(b"alice"), 6);

        store.fail_writes(false);
        limiter.take_available(b"alice", 1);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_remove_surfaces_snapshot_failure() {
        let clock = Arc::new(ManualClock::from_secs(1_000));
        let store = Arc::new(FlakyStore::new());
        let limiter = limiter_on(store.clone(), clock);
        limiter.create(b"alice").unwrap();

        store.fail_writes(true);
        assert!(matches!(
            limiter.remove(b"alice", Duration::ZERO),
            Err(TollgateError::Persistence(_))
        ));
    }

    #[test]
    fn test_failed_ban_aborts_remove() {
        let clock = Arc::new(ManualClock::from_secs(1_000));
        let store = Arc::new(FlakyStore::new());
        let limiter = limiter_on(store.clone(), clock);
        limiter.create(b"alice").unwrap();

        store.fail_writes(true);
        assert!(limiter.remove(b"alice", Duration::from_secs(10)).is_err());
        assert!(limiter.bucket(b"alice").is_some());
    }

    #[test]
    fn test_create_surfaces_store_read_failure() {
        let clock = Arc::new(ManualClock::from_secs(1_000));
        let store = Arc::new(FlakyStore::new());
        let limiter = limiter_on(store.clone(), clock);

        store.fail_reads(true);
        assert!(matches!(
            limiter.create(b"alice"),
            Err(TollgateError::Persistence(_))
        ));
        assert_eq!(limiter.active_count(), 0);
    }

    #[test]
    fn test_remove_unknown_identity_is_noop() {
        let (_, store, limiter) = setup();
        limiter.remove(b"ghost", Duration::ZERO).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_config_preserves_consumed() {
        let (_, _, limiter) = setup();
        limiter.create(b"alice").unwrap();
        limiter.take_available(b"alice", 4);

        limiter.update_config(b"alice", one_per_second(30)).unwrap();
        let bucket = limiter.bucket(b"alice").unwrap();
        assert_eq!(bucket.capacity(), 30);
        assert_eq!(bucket.consumed(), 4);
        assert_eq!(limiter.available(b"alice"), 26);
    }

    #[test]
    fn test_update_config_equivalent_is_noop() {
        let (_, _, limiter) = setup();
        limiter.create(b"alice").unwrap();
        limiter.take_available(b"alice", 4);
        let before = limiter.bucket(b"alice").unwrap();

        let same_rate = LimitConfig::new(Duration::from_secs(3), 10, 3);
        limiter.update_config(b"alice", same_rate).unwrap();

        let after = limiter.bucket(b"alice").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.available(), 6);
    }

    #[test]
    fn test_update_config_does_not_persist() {
        let (_, store, limiter) = setup();
        limiter.update_config(b"alice", one_per_second(30)).unwrap();
        assert!(store.is_empty());
        assert_eq!(limiter.available(b"alice"), 30);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let (_, _, limiter) = setup();
        let invalid = LimitConfig::new(Duration::ZERO, 10, 1);
        assert!(limiter.update_config(b"alice", invalid).is_err());
        assert!(limiter.bucket(b"alice").is_none());
    }

    #[test]
    fn test_shutdown_persists_every_identity() {
        let (_, store, limiter) = setup();
        limiter.take_available(b"a", 1);
        limiter.take_available(b"b", 2);
        assert_eq!(limiter.active_identities().len(), 2);

        limiter.shutdown().unwrap();
        let records = RecordStore::new(store, PREFIX.to_vec());
        assert_eq!(
            records.load_capacity_snapshot(b"b").unwrap().map(|s| s.consumed),
            Some(2)
        );
    }

    #[test]
    fn test_concurrent_takes_on_one_identity() {
        let (_, _, limiter) = setup();
        limiter.update_config(b"hot", one_per_second(500)).unwrap();

        let taken: u64 = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| (0..100).map(|_| limiter.take_available(b"hot", 1)).sum::<u64>()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(taken, 500);
        assert_eq!(limiter.available(b"hot"), 0);
    }
}
