//! Typed access to the limiter's durable records.

use std::sync::Arc;

use tracing::trace;

use super::backend::KvStore;
use super::records::{
    decode_config, decode_deadline, encode_config, encode_deadline, record_key, CapacitySnapshot,
    RecordKind,
};
use crate::error::{hex_identity, Result, TollgateError};
use crate::ratelimit::LimitConfig;

/// Reads and writes blacklist, config override and capacity snapshot records
/// for one limiter namespace.
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn KvStore>,
    prefix: Vec<u8>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("prefix", &String::from_utf8_lossy(&self.prefix))
            .finish()
    }
}

impl RecordStore {
    /// Bind `store` to the namespace `prefix`.
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// The namespace prefix.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn key(&self, kind: RecordKind, identity: &[u8]) -> Vec<u8> {
        record_key(kind, &self.prefix, identity)
    }

    fn get(&self, kind: RecordKind, identity: &[u8]) -> Result<Option<Vec<u8>>> {
        let lookup = self.store.get(&self.key(kind, identity))?;
        trace!(
            kind = %kind,
            identity = %hex_identity(identity),
            found = lookup.is_found(),
            "Loaded record"
        );
        Ok(lookup.into_option())
    }

    /// Load the ban deadline for `identity`.
    pub fn load_blacklist(&self, identity: &[u8]) -> Result<Option<u64>> {
        self.get(RecordKind::Blacklist, identity)?
            .map(|bytes| decode_deadline(&bytes))
            .transpose()
    }

    /// Store a ban deadline for `identity`.
    pub fn put_blacklist(&self, identity: &[u8], deadline: u64) -> Result<()> {
        self.store.put(
            &self.key(RecordKind::Blacklist, identity),
            &encode_deadline(deadline),
        )?;
        Ok(())
    }

    /// Remove any ban record for `identity`.
    pub fn delete_blacklist(&self, identity: &[u8]) -> Result<()> {
        self.store.delete(&self.key(RecordKind::Blacklist, identity))?;
        Ok(())
    }

    /// Load the config override for `identity`.
    ///
    /// Fails with [`TollgateError::Decode`] if the stored bytes do not
    /// describe a valid configuration.
    pub fn load_config_override(&self, identity: &[u8]) -> Result<Option<LimitConfig>> {
        let Some(bytes) = self.get(RecordKind::ConfigOverride, identity)? else {
            return Ok(None);
        };
        decode_config(&bytes)
            .map(Some)
            .map_err(|reason| TollgateError::Decode {
                identity: hex_identity(identity),
                reason,
            })
    }

    /// Store a config override for `identity`.
    pub fn put_config_override(&self, identity: &[u8], config: &LimitConfig) -> Result<()> {
        let bytes = encode_config(config)?;
        self.store
            .put(&self.key(RecordKind::ConfigOverride, identity), &bytes)?;
        Ok(())
    }

    /// Remove any config override for `identity`.
    pub fn delete_config_override(&self, identity: &[u8]) -> Result<()> {
        self.store
            .delete(&self.key(RecordKind::ConfigOverride, identity))?;
        Ok(())
    }

    /// Load the capacity snapshot for `identity`.
    ///
    /// A record of the wrong length fails with
    /// [`TollgateError::MalformedRecord`].
    pub fn load_capacity_snapshot(&self, identity: &[u8]) -> Result<Option<CapacitySnapshot>> {
        self.get(RecordKind::CapacitySnapshot, identity)?
            .map(|bytes| CapacitySnapshot::decode(&bytes))
            .transpose()
    }

    /// Store a capacity snapshot for `identity`.
    pub fn put_capacity_snapshot(&self, identity: &[u8], snapshot: &CapacitySnapshot) -> Result<()> {
        self.store.put(
            &self.key(RecordKind::CapacitySnapshot, identity),
            &snapshot.encode(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::{Lookup, MemoryStore};
    use std::time::Duration;

    fn records() -> (Arc<MemoryStore>, RecordStore) {
        let store = Arc::new(MemoryStore::new());
        let records = RecordStore::new(store.clone(), b"whisper".to_vec());
        (store, records)
    }

    #[test]
    fn test_blacklist_round_trip_and_delete() {
        let (_, records) = records();
        assert_eq!(records.load_blacklist(b"bob").unwrap(), None);

        records.put_blacklist(b"bob", 1060).unwrap();
        assert_eq!(records.load_blacklist(b"bob").unwrap(), Some(1060));

        records.delete_blacklist(b"bob").unwrap();
        assert_eq!(records.load_blacklist(b"bob").unwrap(), None);
    }

    #[test]
    fn test_snapshot_written_under_expected_key() {
        let (store, records) = records();
        let snapshot = CapacitySnapshot {
            consumed: 3,
            saved_at: 99,
        };
        records.put_capacity_snapshot(b"alice", &snapshot).unwrap();

        let raw = store.get(b"\x12whisperalice").unwrap();
        assert_eq!(raw, Lookup::Found(snapshot.encode().to_vec()));
        assert_eq!(
            records.load_capacity_snapshot(b"alice").unwrap(),
            Some(snapshot)
        );
    }

    #[test]
    fn test_prefixes_isolate_namespaces() {
        let store = Arc::new(MemoryStore::new());
        let peers = RecordStore::new(store.clone(), b"peers".to_vec());
        let mail = RecordStore::new(store, b"mail".to_vec());

        peers.put_blacklist(b"id", 42).unwrap();
        assert_eq!(peers.load_blacklist(b"id").unwrap(), Some(42));
        assert_eq!(mail.load_blacklist(b"id").unwrap(), None);
    }

    #[test]
    fn test_config_override_round_trip() {
        let (_, records) = records();
        let config = LimitConfig::new(Duration::from_secs(2), 50, 5);

        records.put_config_override(b"carol", &config).unwrap();
        assert_eq!(records.load_config_override(b"carol").unwrap(), Some(config));

        records.delete_config_override(b"carol").unwrap();
        assert_eq!(records.load_config_override(b"carol").unwrap(), None);
    }

    #[test]
    fn test_undecodable_override_is_decode_error() {
        let (store, records) = records();
        store.put(b"\x11whispercarol", b"not a config").unwrap();

        let err = records.load_config_override(b"carol").unwrap_err();
        assert!(matches!(err, TollgateError::Decode { .. }));
    }

    #[test]
    fn test_store_failure_is_persistence_error() {
        let store = Arc::new(FlakyStore::new());
        store.fail_reads(true);
        let records = RecordStore::new(store, b"p".to_vec());

        let err = records.load_blacklist(b"id").unwrap_err();
        assert!(matches!(err, TollgateError::Persistence(_)));
    }
}
