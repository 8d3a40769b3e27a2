// Network module for the DHT storage node
//
// This module provides the RPC transport nodes use to reach each other.

use crate::error::Result;
use crate::types::wire::{DumpEntry, GetPage};
use crate::types::NodeInfo;
use async_trait::async_trait;
use bytes::Bytes;

pub mod http;
pub mod local;

pub use http::HttpTransport;
pub use local::InProcessTransport;

/// Node-to-node DHT RPCs.
///
/// Any `Err` is a transport-level or remote failure. Timeouts are the
/// transport's business and surface as `DhtError::Timeout`.
#[async_trait]
pub trait DhtTransport: Send + Sync {
    /// Store at `node` and have it forward to its redundant neighbor.
    async fn put(
        &self,
        node: &NodeInfo,
        key: Bytes,
        value: Bytes,
        ttl: u64,
        unique: bool,
    ) -> Result<bool>;

    /// Store at `node` only.
    async fn put_apply(
        &self,
        node: &NodeInfo,
        key: Bytes,
        value: Bytes,
        ttl: u64,
        unique: bool,
    ) -> Result<bool>;

    /// Fetch one page of the versions `node` holds for `key`.
    async fn get(&self, node: &NodeInfo, key: Bytes, token: Option<Bytes>) -> Result<GetPage>;

    /// Every live entry held by `node`.
    async fn dump(&self, node: &NodeInfo) -> Result<Vec<DumpEntry>>;

    /// Number of live entries held by `node`.
    async fn count(&self, node: &NodeInfo) -> Result<usize>;
}
