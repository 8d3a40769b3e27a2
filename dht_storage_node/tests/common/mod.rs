//! In-process cluster used by the integration tests.
//!
//! Nodes share one `InProcessTransport` and each keep their own membership
//! table. Churn is applied by hand so tests decide exactly when a node
//! re-reads its neighbors.

#![allow(dead_code)]

use bytes::Bytes;
use dht_storage_node::client::DhtClient;
use dht_storage_node::network::InProcessTransport;
use dht_storage_node::ring::{ConnectionState, MembershipTable, RingPosition, RingTopology};
use dht_storage_node::storage::DhtService;
use dht_storage_node::types::NodeInfo;
use std::sync::Arc;
use std::time::Duration;

pub const QUARTER: u128 = 1 << 126;

pub struct TestNode {
    pub info: NodeInfo,
    pub table: Arc<MembershipTable>,
    pub service: Arc<DhtService>,
    pub client: Arc<DhtClient>,
}

pub struct TestCluster {
    pub transport: Arc<InProcessTransport>,
    pub nodes: Vec<TestNode>,
    degree: usize,
    max_parallel: usize,
}

impl TestCluster {
    /// Connected cluster with one node per address, every node knowing every other.
    pub fn new(addresses: &[u128], degree: usize) -> Self {
        Self::with_parallelism(addresses, degree, 10)
    }

    pub fn with_parallelism(addresses: &[u128], degree: usize, max_parallel: usize) -> Self {
        let mut cluster = Self {
            transport: Arc::new(InProcessTransport::new()),
            nodes: Vec::new(),
            degree,
            max_parallel,
        };
        for (i, address) in addresses.iter().enumerate() {
            cluster.spawn_node(&format!("node-{}", i), *address);
        }
        for node in &cluster.nodes {
            for other in &cluster.nodes {
                node.table.add_peer(other.info.clone());
            }
        }
        for node in &cluster.nodes {
            node.table.set_state(ConnectionState::Connected);
            node.service.on_state_changed(ConnectionState::Connected);
            node.client.on_state_changed(ConnectionState::Connected);
        }
        cluster
    }

    fn spawn_node(&mut self, id: &str, address: u128) -> usize {
        let info = NodeInfo::with_address(id, RingPosition(address), format!("mem://{}", id));
        let table = Arc::new(MembershipTable::new(info.clone()));
        let service = Arc::new(DhtService::new(
            table.clone(),
            self.transport.clone(),
            self.max_parallel,
        ));
        self.transport.register(&service);
        let client = Arc::new(
            DhtClient::new(table.clone(), self.transport.clone(), self.degree)
                .expect("tests run inside a runtime"),
        );
        self.nodes.push(TestNode {
            info,
            table,
            service,
            client,
        });
        self.nodes.len() - 1
    }

    /// Add a node and let every existing node observe it.
    pub fn join(&mut self, id: &str, address: u128) -> usize {
        let index = self.spawn_node(id, address);
        let newcomer = self.nodes[index].info.clone();
        for node in &self.nodes[..index] {
            node.table.add_peer(newcomer.clone());
            self.nodes[index].table.add_peer(node.info.clone());
        }
        let new_node = &self.nodes[index];
        new_node.service.on_state_changed(ConnectionState::Connected);
        new_node.client.on_state_changed(ConnectionState::Connected);
        for node in &self.nodes[..index] {
            node.service.on_connections_changed();
        }
        index
    }

    /// Remove `id` from every other node's table and let them react.
    pub fn forget(&self, id: &str) {
        for node in self.nodes.iter().filter(|node| node.info.id != id) {
            node.table.remove_peer(id);
            node.service.on_connections_changed();
        }
    }

    pub fn client(&self) -> &DhtClient {
        &self.nodes[0].client
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.info.id == id)
            .expect("unknown test node")
    }

    /// The node serving `position`, as seen from the first node.
    pub fn closest(&self, position: RingPosition) -> &TestNode {
        let id = self.nodes[0]
            .table
            .closest_node(position)
            .expect("cluster is never empty")
            .id;
        self.node(&id)
    }
}

pub fn replica_key(position: RingPosition) -> Bytes {
    Bytes::copy_from_slice(&position.to_key_bytes())
}

/// Poll `condition` every few milliseconds, failing the test after five seconds.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn stored_values(service: &DhtService, key: Bytes) -> Vec<Bytes> {
    service
        .get(key, None)
        .await
        .expect("node is online")
        .entries
        .into_iter()
        .map(|entry| entry.value)
        .collect()
}
