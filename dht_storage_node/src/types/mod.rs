// Types module for the DHT storage node
//
// This module defines the entry model shared by the local store, the wire
// encoding and the replication client.

use crate::ring::RingPosition;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod wire;

/// Hard cap on a single value and on the cumulative value bytes of one page.
pub const MAX_VALUE_BYTES: usize = 1024;

/// A node of the structured overlay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    /// Node ID
    pub id: String,

    /// Ring address
    pub address: RingPosition,

    /// HTTP endpoint, e.g. `http://10.0.0.5:8080`
    pub endpoint: String,
}

impl NodeInfo {
    /// Create a node whose ring address is derived from its id.
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            address: RingPosition::for_node_id(&id),
            id,
            endpoint: endpoint.into(),
        }
    }

    /// Create a node at an explicit ring address.
    pub fn with_address(
        id: impl Into<String>,
        address: RingPosition,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address,
            endpoint: endpoint.into(),
        }
    }
}

/// One stored version of a key.
///
/// Identity is `(key, value)`; two entries for the same key with different
/// values are distinct versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Entry {
    pub fn new(key: Bytes, value: Bytes, ttl_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            value,
            created_at: now,
            expires_at: now + ttl_duration(ttl_secs),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whole seconds left before expiry, zero once expired.
    pub fn remaining_ttl_at(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }

    /// Whole seconds since the entry was first stored.
    pub fn age_at(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created_at).num_seconds().max(0) as u64
    }
}

/// Clamp a TTL in seconds into a chrono duration.
pub fn ttl_duration(ttl_secs: u64) -> Duration {
    // chrono panics past ~292 billion years; a century is plenty
    const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 3600;
    Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64)
}

/// A value returned to DHT clients with its averaged remaining lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtValue {
    #[serde(with = "wire::base64_bytes")]
    pub value: Bytes,
    pub ttl: u64,
    pub age: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_lifetime_accounting() {
        let now = Utc::now();
        let entry = Entry::new(Bytes::from_static(b"k"), Bytes::from_static(b"v"), 60, now);
        assert!(!entry.is_expired_at(now));
        assert_eq!(entry.remaining_ttl_at(now), 60);
        assert_eq!(entry.age_at(now + Duration::seconds(10)), 10);
        assert!(entry.is_expired_at(now + Duration::seconds(60)));
        assert_eq!(entry.remaining_ttl_at(now + Duration::seconds(90)), 0);
    }

    #[test]
    fn node_address_is_derived_from_id() {
        let node = NodeInfo::new("node-a", "http://127.0.0.1:1");
        assert_eq!(node.address, RingPosition::for_node_id("node-a"));
        let json = serde_json::to_string(&node).unwrap();
        let back: NodeInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
