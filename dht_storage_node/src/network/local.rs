// In-process transport connecting services that share one runtime
//
// Used for local simulations and tests. Nodes can be marked unreachable or
// slowed down to emulate failures and latency.

use super::DhtTransport;
use crate::error::{DhtError, Result};
use crate::storage::DhtService;
use crate::types::wire::{DumpEntry, GetPage};
use crate::types::NodeInfo;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Default)]
pub struct InProcessTransport {
    services: DashMap<String, Weak<DhtService>>,
    unreachable: DashSet<String>,
    latency: DashMap<String, Duration>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service` reachable under its node id.
    pub fn register(&self, service: &Arc<DhtService>) {
        let id = service.local_node().id;
        self.services.insert(id, Arc::downgrade(service));
    }

    pub fn unregister(&self, id: &str) {
        self.services.remove(id);
    }

    /// Fail every call to `id` until cleared.
    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(id.to_string());
        } else {
            self.unreachable.remove(id);
        }
    }

    /// Delay every call to `id` by `delay`.
    pub fn set_latency(&self, id: &str, delay: Duration) {
        self.latency.insert(id.to_string(), delay);
    }

    async fn resolve(&self, node: &NodeInfo) -> Result<Arc<DhtService>> {
        let delay = self.latency.get(&node.id).map(|entry| *entry.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.contains(&node.id) {
            return Err(DhtError::Network(format!("{} is unreachable", node.id)));
        }
        self.services
            .get(&node.id)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| DhtError::Network(format!("Unknown node: {}", node.id)))
    }
}

#[async_trait]
impl DhtTransport for InProcessTransport {
    async fn put(
        &self,
        node: &NodeInfo,
        key: Bytes,
        value: Bytes,
        ttl: u64,
        unique: bool,
    ) -> Result<bool> {
        self.resolve(node).await?.put(key, value, ttl, unique).await
    }

    async fn put_apply(
        &self,
        node: &NodeInfo,
        key: Bytes,
        value: Bytes,
        ttl: u64,
        unique: bool,
    ) -> Result<bool> {
        self.resolve(node)
            .await?
            .put_apply(key, value, ttl, unique)
            .await
    }

    async fn get(&self, node: &NodeInfo, key: Bytes, token: Option<Bytes>) -> Result<GetPage> {
        self.resolve(node).await?.get(key, token).await
    }

    async fn dump(&self, node: &NodeInfo) -> Result<Vec<DumpEntry>> {
        Ok(self.resolve(node).await?.dump())
    }

    async fn count(&self, node: &NodeInfo) -> Result<usize> {
        Ok(self.resolve(node).await?.count())
    }
}
