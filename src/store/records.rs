//! Durable record kinds, key construction and byte layouts.
//!
//! Keys are `kind_tag || prefix || identity`. The prefix lets independent
//! limiter instances share one store; two instances must never share a
//! prefix, and no prefix may be a leading substring of another.

use std::fmt;

use crate::error::{Result, TollgateError};
use crate::ratelimit::LimitConfig;

/// Length of an encoded blacklist record.
pub const BLACKLIST_RECORD_LEN: usize = 8;
/// Length of an encoded capacity snapshot.
pub const SNAPSHOT_RECORD_LEN: usize = 16;

/// The kind of a durable record. Each kind owns a distinct key tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Ban deadline
    Blacklist,
    /// Per-identity limit override
    ConfigOverride,
    /// Consumed-token checkpoint
    CapacitySnapshot,
}

impl RecordKind {
    /// Leading key byte for this kind.
    pub fn tag(&self) -> u8 {
        match self {
            RecordKind::Blacklist => 0x10,
            RecordKind::ConfigOverride => 0x11,
            RecordKind::CapacitySnapshot => 0x12,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Blacklist => "blacklist",
            RecordKind::ConfigOverride => "config override",
            RecordKind::CapacitySnapshot => "capacity snapshot",
        };
        f.write_str(name)
    }
}

/// Build the store key for a record.
pub fn record_key(kind: RecordKind, prefix: &[u8], identity: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + prefix.len() + identity.len());
    key.push(kind.tag());
    key.extend_from_slice(prefix);
    key.extend_from_slice(identity);
    key
}

/// Durable checkpoint of how much of an identity's capacity was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    /// Tokens consumed out of capacity
    pub consumed: u64,
    /// Unix seconds at which the checkpoint was taken
    pub saved_at: u64,
}

impl CapacitySnapshot {
    /// Encode as 16 big-endian bytes: consumed, then saved_at.
    pub fn encode(&self) -> [u8; SNAPSHOT_RECORD_LEN] {
        let mut buf = [0u8; SNAPSHOT_RECORD_LEN];
        buf[..8].copy_from_slice(&self.consumed.to_be_bytes());
        buf[8..].copy_from_slice(&self.saved_at.to_be_bytes());
        buf
    }

    /// Decode a 16-byte record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let buf: [u8; SNAPSHOT_RECORD_LEN] =
            bytes.try_into().map_err(|_| TollgateError::MalformedRecord {
                kind: RecordKind::CapacitySnapshot,
                expected: SNAPSHOT_RECORD_LEN,
                actual: bytes.len(),
            })?;
        let mut consumed = [0u8; 8];
        let mut saved_at = [0u8; 8];
        consumed.copy_from_slice(&buf[..8]);
        saved_at.copy_from_slice(&buf[8..]);
        Ok(Self {
            consumed: u64::from_be_bytes(consumed),
            saved_at: u64::from_be_bytes(saved_at),
        })
    }
}

/// Encode a ban deadline as 8 big-endian bytes.
pub fn encode_deadline(deadline: u64) -> [u8; BLACKLIST_RECORD_LEN] {
    deadline.to_be_bytes()
}

/// Decode an 8-byte ban deadline.
pub fn decode_deadline(bytes: &[u8]) -> Result<u64> {
    let buf: [u8; BLACKLIST_RECORD_LEN] =
        bytes.try_into().map_err(|_| TollgateError::MalformedRecord {
            kind: RecordKind::Blacklist,
            expected: BLACKLIST_RECORD_LEN,
            actual: bytes.len(),
        })?;
    Ok(u64::from_be_bytes(buf))
}

/// Encode a config override. The layout is a JSON object of the three
/// `u64` fields; there is no compatibility promise across schema changes.
pub fn encode_config(config: &LimitConfig) -> Result<Vec<u8>> {
    serde_json::to_vec(config).map_err(|e| TollgateError::InvalidConfig(e.to_string()))
}

/// Decode a config override, returning the parser message on failure.
pub fn decode_config(bytes: &[u8]) -> std::result::Result<LimitConfig, String> {
    let config: LimitConfig = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}
