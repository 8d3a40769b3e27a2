// Per-node DHT service endpoint
//
// Accepts Put/PutApply/Get for the keys this node stores, forwards every
// Put to one redundant neighbor, and migrates key ranges when the ring
// neighbors change.

use super::local_store::{LocalStore, PutOutcome};
use super::tasks::ExpirySweeper;
use super::transfer::{TransferProgress, TransferState};
use crate::error::{DhtError, Result};
use crate::network::DhtTransport;
use crate::ring::{ConnectionState, OverlayEvent, RingPosition, RingTopology};
use crate::types::wire::{DumpEntry, GetPage};
use crate::types::{NodeInfo, MAX_VALUE_BYTES};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which structured neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

/// Migration bookkeeping for one side, as seen from outside
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "node", rename_all = "snake_case")]
pub enum NeighborPhase {
    NoNeighbor,
    Stable(NodeInfo),
    Migrating(NodeInfo),
}

#[derive(Default)]
struct SideState {
    neighbor: Option<NodeInfo>,
    transfer: Option<TransferState>,
}

impl SideState {
    fn interrupt(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            transfer.interrupt();
        }
    }

    fn phase(&self) -> NeighborPhase {
        match (&self.neighbor, &self.transfer) {
            (None, _) => NeighborPhase::NoNeighbor,
            (Some(node), Some(transfer)) if !transfer.is_finished() => {
                NeighborPhase::Migrating(node.clone())
            }
            (Some(node), _) => NeighborPhase::Stable(node.clone()),
        }
    }
}

#[derive(Default)]
struct ChurnState {
    left: SideState,
    right: SideState,
}

impl ChurnState {
    fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    fn side(&self, side: Side) -> &SideState {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

/// The DHT request handler of one node
pub struct DhtService {
    topology: Arc<dyn RingTopology>,
    transport: Arc<dyn DhtTransport>,
    store: Arc<Mutex<LocalStore>>,
    churn: Mutex<ChurnState>,
    online: AtomicBool,
    max_parallel_transfers: usize,
}

impl DhtService {
    /// Create an offline service; it goes online on the first `Connected` state.
    pub fn new(
        topology: Arc<dyn RingTopology>,
        transport: Arc<dyn DhtTransport>,
        max_parallel_transfers: usize,
    ) -> Self {
        Self {
            topology,
            transport,
            store: Arc::new(Mutex::new(LocalStore::new())),
            churn: Mutex::new(ChurnState::default()),
            online: AtomicBool::new(false),
            max_parallel_transfers: max_parallel_transfers.max(1),
        }
    }

    pub fn local_node(&self) -> NodeInfo {
        self.topology.local_node()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(DhtError::Offline)
        }
    }

    /// Store locally and on the redundant neighbor.
    ///
    /// The neighbor is the right one when this node is ring-left of the key,
    /// the left one otherwise. If the neighbor does not confirm, a version
    /// this call inserted is rolled back.
    pub async fn put(&self, key: Bytes, value: Bytes, ttl: u64, unique: bool) -> Result<bool> {
        self.ensure_online()?;
        if value.len() > MAX_VALUE_BYTES {
            return Err(DhtError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_BYTES,
            });
        }

        let outcome = self
            .store
            .lock()
            .put(key.clone(), value.clone(), ttl, unique)?;

        let local = self.topology.local_node();
        let key_position = RingPosition::from_stored_key(&key);
        let neighbor = if local.address.is_left_of(key_position) {
            self.topology.right_neighbor()
        } else {
            self.topology.left_neighbor()
        };

        let Some(neighbor) = neighbor else {
            debug!("No neighbor to forward key {} to", hex::encode(&key));
            return Ok(true);
        };

        let failure = match self
            .transport
            .put_apply(&neighbor, key.clone(), value.clone(), ttl, unique)
            .await
        {
            Ok(true) => return Ok(true),
            Ok(false) => format!("{} refused the write", neighbor.id),
            Err(e) => format!("{}: {}", neighbor.id, e),
        };

        if outcome == PutOutcome::Inserted {
            self.store.lock().remove(&key, &value);
        }
        warn!(
            "Forward of key {} failed, local write rolled back: {}",
            hex::encode(&key),
            failure
        );
        Err(DhtError::ForwardFailed(failure))
    }

    /// Store locally only; used by neighbors forwarding writes and by migrations.
    pub async fn put_apply(&self, key: Bytes, value: Bytes, ttl: u64, unique: bool) -> Result<bool> {
        self.ensure_online()?;
        self.store.lock().put(key, value, ttl, unique)?;
        Ok(true)
    }

    pub async fn get(&self, key: Bytes, token: Option<Bytes>) -> Result<GetPage> {
        self.ensure_online()?;
        self.store.lock().get(&key, token.as_deref())
    }

    pub fn dump(&self) -> Vec<DumpEntry> {
        self.store.lock().dump_at(Utc::now())
    }

    pub fn count(&self) -> usize {
        self.store.lock().count()
    }

    /// Run the periodic expiry sweep over this node's store.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        ExpirySweeper::new(self.store.clone(), period).spawn()
    }

    pub fn neighbor_phase(&self, side: Side) -> NeighborPhase {
        self.churn.lock().side(side).phase()
    }

    /// Progress of the migration currently or last running on `side`.
    pub fn transfer_progress(&self, side: Side) -> Option<TransferProgress> {
        self.churn
            .lock()
            .side(side)
            .transfer
            .as_ref()
            .map(TransferState::progress)
    }

    /// React to an overlay state change.
    pub fn on_state_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                if !self.online.swap(true, Ordering::SeqCst) {
                    info!("DHT on {} is online", self.local_node().id);
                }
                self.on_connections_changed();
            }
            ConnectionState::Leaving | ConnectionState::Disconnected | ConnectionState::Offline => {
                if self.online.swap(false, Ordering::SeqCst) {
                    info!("DHT on {} is offline ({:?})", self.local_node().id, state);
                }
                let mut churn = self.churn.lock();
                for side in [Side::Left, Side::Right] {
                    let side_state = churn.side_mut(side);
                    side_state.interrupt();
                    side_state.neighbor = None;
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Re-read both structured neighbors and migrate to any new one.
    pub fn on_connections_changed(&self) {
        if !self.is_online() {
            return;
        }
        let local = self.topology.local_node();
        let observed = [
            (Side::Left, self.topology.left_neighbor()),
            (Side::Right, self.topology.right_neighbor()),
        ];

        let mut churn = self.churn.lock();
        for (side, neighbor) in observed {
            let side_state = churn.side_mut(side);
            let recorded = side_state.neighbor.as_ref().map(|node| node.address);
            let current = neighbor.as_ref().map(|node| node.address);
            if recorded == current {
                continue;
            }

            side_state.interrupt();
            side_state.neighbor = neighbor.clone();
            let Some(neighbor) = neighbor else {
                debug!("{:?} neighbor of {} is gone", side, local.id);
                continue;
            };
            info!("New {:?} neighbor for {}: {}", side, local.id, neighbor.id);

            let entries = {
                let store = self.store.lock();
                if store.count() == 0 {
                    continue;
                }
                store
                    .keys_in_range(local.address, neighbor.address)
                    .iter()
                    .flat_map(|key| store.entries(key))
                    .collect::<Vec<_>>()
            };
            side_state.transfer = Some(TransferState::start(
                neighbor,
                entries,
                self.transport.clone(),
                self.max_parallel_transfers,
            ));
        }
    }

    pub fn handle_overlay_event(&self, event: OverlayEvent) {
        match event {
            OverlayEvent::StateChanged(state) => self.on_state_changed(state),
            OverlayEvent::ConnectionsChanged => self.on_connections_changed(),
        }
    }

    /// Follow membership notifications until the channel or the service goes away.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<OverlayEvent>,
    ) -> JoinHandle<()> {
        let service: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} overlay events, rechecking neighbors", skipped);
                        OverlayEvent::ConnectionsChanged
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.handle_overlay_event(event);
            }
            debug!("Overlay event loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InProcessTransport;
    use crate::ring::MembershipTable;

    fn node(id: &str, address: u128) -> NodeInfo {
        NodeInfo::with_address(id, RingPosition(address), format!("mem://{}", id))
    }

    fn service(table: &Arc<MembershipTable>, transport: &Arc<InProcessTransport>) -> Arc<DhtService> {
        let service = Arc::new(DhtService::new(table.clone(), transport.clone(), 10));
        transport.register(&service);
        service
    }

    fn key_at(position: u128) -> Bytes {
        Bytes::copy_from_slice(&RingPosition(position).to_key_bytes())
    }

    #[tokio::test]
    async fn rejects_requests_while_offline() {
        let transport = Arc::new(InProcessTransport::new());
        let table = Arc::new(MembershipTable::new(node("a", 0)));
        let service = service(&table, &transport);

        let result = service.put(key_at(5), Bytes::from_static(b"v"), 60, false).await;
        assert_eq!(result, Err(DhtError::Offline));

        service.on_state_changed(ConnectionState::Connected);
        assert_eq!(service.put(key_at(5), Bytes::from_static(b"v"), 60, false).await, Ok(true));

        service.on_state_changed(ConnectionState::Leaving);
        assert!(matches!(
            service.get(key_at(5), None).await,
            Err(DhtError::Offline)
        ));
    }

    #[tokio::test]
    async fn put_forwards_to_the_neighbor_on_the_key_side() {
        let transport = Arc::new(InProcessTransport::new());
        let low = node("low", 100);
        let high = node("high", 1_000);
        let mid = node("mid", 500);

        let table = Arc::new(MembershipTable::new(mid.clone()));
        table.add_peer(low.clone());
        table.add_peer(high.clone());
        let svc = service(&table, &transport);

        let mut others = Vec::new();
        for peer in [&low, &high] {
            let peer_table = Arc::new(MembershipTable::new(peer.clone()));
            let peer_service = service(&peer_table, &transport);
            peer_service.on_state_changed(ConnectionState::Connected);
            others.push(peer_service);
        }
        svc.on_state_changed(ConnectionState::Connected);

        // key below mid: mid is ring-left of it, so the right neighbor (low) gets a copy
        svc.put(key_at(300), Bytes::from_static(b"x"), 60, false).await.unwrap();
        assert_eq!(others[0].count(), 1);
        assert_eq!(others[1].count(), 0);

        // key above mid goes to the left neighbor (high)
        svc.put(key_at(700), Bytes::from_static(b"y"), 60, false).await.unwrap();
        assert_eq!(others[1].count(), 1);
        assert_eq!(svc.count(), 2);
    }

    #[tokio::test]
    async fn failed_forward_rolls_back_only_new_versions() {
        let transport = Arc::new(InProcessTransport::new());
        let neighbor = node("n", 100);
        let table = Arc::new(MembershipTable::new(node("a", 500)));
        table.add_peer(neighbor.clone());
        let svc = service(&table, &transport);
        svc.on_state_changed(ConnectionState::Connected);

        // neighbor never registered with the transport: every forward fails
        let result = svc.put(key_at(300), Bytes::from_static(b"x"), 60, false).await;
        assert!(matches!(result, Err(DhtError::ForwardFailed(_))));
        assert_eq!(svc.count(), 0);

        // an existing version survives a failed refresh
        svc.put_apply(key_at(300), Bytes::from_static(b"x"), 60, false).await.unwrap();
        let _ = svc.put(key_at(300), Bytes::from_static(b"x"), 60, false).await;
        assert_eq!(svc.count(), 1);
    }

    #[tokio::test]
    async fn oversized_put_is_rejected_before_storage() {
        let transport = Arc::new(InProcessTransport::new());
        let table = Arc::new(MembershipTable::new(node("a", 0)));
        let svc = service(&table, &transport);
        svc.on_state_changed(ConnectionState::Connected);

        let big = Bytes::from(vec![1u8; MAX_VALUE_BYTES + 1]);
        assert!(matches!(
            svc.put(key_at(1), big, 60, false).await,
            Err(DhtError::ValueTooLarge { .. })
        ));
        assert_eq!(svc.count(), 0);
    }

    #[tokio::test]
    async fn new_neighbor_starts_a_migration_only_with_data() {
        let transport = Arc::new(InProcessTransport::new());
        let table = Arc::new(MembershipTable::new(node("a", 0)));
        let svc = service(&table, &transport);
        svc.on_state_changed(ConnectionState::Connected);

        let empty_peer = node("b", 1_000);
        table.add_peer(empty_peer.clone());
        svc.on_connections_changed();
        assert_eq!(svc.neighbor_phase(Side::Left), NeighborPhase::Stable(empty_peer.clone()));
        assert!(svc.transfer_progress(Side::Left).is_none());

        svc.put_apply(key_at(10), Bytes::from_static(b"v"), 60, false).await.unwrap();
        let peer_table = Arc::new(MembershipTable::new(node("c", 500)));
        let peer = service(&peer_table, &transport);
        peer.on_state_changed(ConnectionState::Connected);
        table.add_peer(node("c", 500));
        svc.on_connections_changed();

        let report = svc.transfer_progress(Side::Left).unwrap().finished().await;
        assert_eq!(report.sent, 1);
        assert_eq!(peer.count(), 1);
    }

    #[tokio::test]
    async fn leaving_clears_neighbors_and_transfers() {
        let transport = Arc::new(InProcessTransport::new());
        let table = Arc::new(MembershipTable::new(node("a", 0)));
        table.add_peer(node("b", 1_000));
        let svc = service(&table, &transport);
        svc.on_state_changed(ConnectionState::Connected);
        assert!(matches!(svc.neighbor_phase(Side::Right), NeighborPhase::Stable(_)));

        svc.on_state_changed(ConnectionState::Disconnected);
        assert_eq!(svc.neighbor_phase(Side::Left), NeighborPhase::NoNeighbor);
        assert_eq!(svc.neighbor_phase(Side::Right), NeighborPhase::NoNeighbor);
        assert!(!svc.is_online());
    }

    #[tokio::test]
    async fn event_loop_follows_the_membership_table() {
        let transport = Arc::new(InProcessTransport::new());
        let table = Arc::new(MembershipTable::new(node("a", 0)));
        let svc = service(&table, &transport);
        let handle = svc.spawn_event_loop(table.subscribe());

        table.set_state(ConnectionState::Connected);
        table.add_peer(node("b", 1_000));

        tokio::time::timeout(Duration::from_secs(5), async {
            while svc.neighbor_phase(Side::Left) == NeighborPhase::NoNeighbor {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(svc.is_online());

        drop(svc);
        table.set_state(ConnectionState::Leaving);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
