//! Error types for Tollgate operations.

use thiserror::Error;

use crate::store::{RecordKind, StoreError};

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// The identity is banned from bucket creation until `deadline`.
    #[error("identity {identity} is blacklisted until {deadline}")]
    Blacklisted {
        /// Hex rendering of the identity
        identity: String,
        /// Unix-seconds deadline of the ban
        deadline: u64,
    },

    /// The durable store failed
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// A stored config override could not be parsed
    #[error("failed to decode config override for {identity}: {reason}")]
    Decode {
        /// Hex rendering of the identity
        identity: String,
        /// Parser message
        reason: String,
    },

    /// A stored record has an unexpected byte length
    #[error("malformed {kind} record: expected {expected} bytes, found {actual}")]
    MalformedRecord {
        /// Which record kind was malformed
        kind: RecordKind,
        /// Expected length in bytes
        expected: usize,
        /// Stored length in bytes
        actual: usize,
    },

    /// A limit configuration violates its invariants
    #[error("invalid limit configuration: {0}")]
    InvalidConfig(String),

    /// Settings loading errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

/// Lowercase hex rendering of an identity for logs and error messages.
pub(crate) fn hex_identity(identity: &[u8]) -> String {
    hex::encode(identity)
}
