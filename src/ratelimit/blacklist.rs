//! Temporary bans, enforced lazily at bucket creation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{hex_identity, Result, TollgateError};
use crate::store::RecordStore;

/// Writes and enforces ban deadlines.
///
/// A ban written at `T` for `D` rejects creation until `T + D`, rounded up
/// to the next whole second.
/// Expired records stay in the store until the identity next tries to
/// create a bucket.
pub struct BlacklistManager {
    records: RecordStore,
    clock: Arc<dyn Clock>,
}

impl BlacklistManager {
    /// Create a manager over `records`.
    pub fn new(records: RecordStore, clock: Arc<dyn Clock>) -> Self {
        Self { records, clock }
    }

    /// Ban `identity` for `duration`. A zero duration writes nothing.
    pub fn ban(&self, identity: &[u8], duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }
        // Whole seconds, rounded up: the ban never ends before `now + duration`.
        let deadline = self
            .clock
            .now()
            .checked_add(duration)
            .map_or(u64::MAX, |end| {
                end.as_secs().saturating_add(u64::from(end.subsec_nanos() > 0))
            });

        self.records.put_blacklist(identity, deadline)?;
        info!(
            identity = %hex_identity(identity),
            deadline,
            "Blacklisted identity"
        );
        Ok(())
    }

    /// Fail with [`TollgateError::Blacklisted`] while a ban is active.
    ///
    /// An expired or unreadable ban record is deleted.
    pub fn check(&self, identity: &[u8]) -> Result<()> {
        let deadline = match self.records.load_blacklist(identity) {
            Ok(Some(deadline)) => deadline,
            Ok(None) => return Ok(()),
            Err(e @ TollgateError::MalformedRecord { .. }) => {
                warn!(
                    identity = %hex_identity(identity),
                    error = %e,
                    "Discarding unreadable blacklist record"
                );
                return self.records.delete_blacklist(identity);
            }
            Err(e) => return Err(e),
        };

        if self.clock.now() < Duration::from_secs(deadline) {
            debug!(identity = %hex_identity(identity), deadline, "Rejected blacklisted identity");
            return Err(TollgateError::Blacklisted {
                identity: hex_identity(identity),
                deadline,
            });
        }

        debug!(identity = %hex_identity(identity), deadline, "Clearing expired blacklist record");
        self.records.delete_blacklist(identity)
    }

    /// The stored ban deadline for `identity`, expired or not.
    pub fn deadline(&self, identity: &[u8]) -> Result<Option<u64>> {
        self.records.load_blacklist(identity)
    }
}
