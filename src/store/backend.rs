//! Key-value store contract.
//!
//! The limiter treats its durable storage as an opaque ordered key-value
//! store. Implementations must be thread-safe; every call is synchronous
//! and may block the caller.

use thiserror::Error;

/// Errors raised by a [`KvStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying file or device I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store's on-disk image could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Outcome of a successful [`KvStore::get`].
///
/// A missing key is a normal outcome, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The key exists with this value
    Found(Vec<u8>),
    /// The key does not exist
    NotFound,
}

impl Lookup {
    /// Convert into an `Option`.
    pub fn into_option(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    /// Whether the key was found.
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// Trait for pluggable key-value store implementations.
pub trait KvStore: Send + Sync {
    /// Retrieve the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Lookup, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`. Deleting a missing key succeeds.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
}
