//! Durable storage for limiter state.
//!
//! [`KvStore`] is the opaque key-value contract the limiter persists through;
//! [`RecordStore`] layers the three record kinds and their byte layouts on
//! top of it.

mod adapter;
mod backend;
mod file;
mod memory;
mod records;

pub use adapter::RecordStore;
pub use backend::{KvStore, Lookup, StoreError};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use records::{record_key, CapacitySnapshot, RecordKind};
