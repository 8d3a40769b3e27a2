// Membership table for the ring overlay
//
// Tracks the nodes this node knows about, ordered by ring address, and the
// local overlay connection state. Every change is announced on a broadcast
// channel so the DHT can react to churn.

use super::{RingPosition, RingTopology};
use crate::types::NodeInfo;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 256;

/// Overlay membership state of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Offline,
    Connecting,
    Connected,
    Leaving,
    Disconnected,
}

/// Change notification published by the membership table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEvent {
    /// The set of known structured peers changed
    ConnectionsChanged,
    /// The local node moved to a new overlay state
    StateChanged(ConnectionState),
}

/// In-tree [`RingTopology`] backed by an ordered table of peers
pub struct MembershipTable {
    local: NodeInfo,
    peers: RwLock<BTreeMap<RingPosition, NodeInfo>>,
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<OverlayEvent>,
}

impl MembershipTable {
    /// Create a table for `local`, starting offline with no peers.
    pub fn new(local: NodeInfo) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local,
            peers: RwLock::new(BTreeMap::new()),
            state: RwLock::new(ConnectionState::Offline),
            events,
        }
    }

    /// Subscribe to membership and state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        info!("Overlay state of {} is now {:?}", self.local.id, state);
        self.publish(OverlayEvent::StateChanged(state));
    }

    /// Add or replace a peer. Returns false for the local node itself.
    pub fn add_peer(&self, node: NodeInfo) -> bool {
        if node.id == self.local.id || node.address == self.local.address {
            return false;
        }
        {
            let mut peers = self.peers.write();
            peers.retain(|_, existing| existing.id != node.id);
            debug!("Adding peer {} at {}", node.id, node.address);
            peers.insert(node.address, node);
        }
        self.publish(OverlayEvent::ConnectionsChanged);
        true
    }

    /// Remove a peer by id.
    pub fn remove_peer(&self, id: &str) -> Option<NodeInfo> {
        let removed = {
            let mut peers = self.peers.write();
            let address = peers
                .iter()
                .find(|(_, node)| node.id == id)
                .map(|(address, _)| *address)?;
            peers.remove(&address)
        };
        if removed.is_some() {
            debug!("Removed peer {}", id);
            self.publish(OverlayEvent::ConnectionsChanged);
        }
        removed
    }

    /// All known peers in ring order.
    pub fn peers(&self) -> Vec<NodeInfo> {
        self.peers.read().values().cloned().collect()
    }

    fn publish(&self, event: OverlayEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl RingTopology for MembershipTable {
    fn local_node(&self) -> NodeInfo {
        self.local.clone()
    }

    fn closest_node(&self, position: RingPosition) -> Option<NodeInfo> {
        let peers = self.peers.read();
        let mut best = &self.local;
        let mut best_distance = self.local.address.abs_distance(position);
        for node in peers.values() {
            let distance = node.address.abs_distance(position);
            if distance < best_distance {
                best = node;
                best_distance = distance;
            }
        }
        Some(best.clone())
    }

    fn left_neighbor(&self) -> Option<NodeInfo> {
        let peers = self.peers.read();
        peers
            .range((Excluded(self.local.address), Unbounded))
            .next()
            .or_else(|| peers.iter().next())
            .map(|(_, node)| node.clone())
    }

    fn right_neighbor(&self) -> Option<NodeInfo> {
        let peers = self.peers.read();
        peers
            .range(..self.local.address)
            .next_back()
            .or_else(|| peers.iter().next_back())
            .map(|(_, node)| node.clone())
    }
}
