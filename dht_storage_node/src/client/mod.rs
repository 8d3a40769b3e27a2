//! Replication client
//!
//! Fans every request out to the `degree` replica positions of a key and
//! reconciles the replies: a value is returned once a majority of replicas
//! confirm it, a write succeeds once a majority accept it. After a Get has
//! heard from every replica, majority values missing from some replicas are
//! written back to them.

use crate::error::{DhtError, Result};
use crate::network::DhtTransport;
use crate::ring::{self, ConnectionState, OverlayEvent, RingPosition, RingTopology};
use crate::types::wire::PageEntry;
use crate::types::DhtValue;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod get_state;
pub mod proxy;
pub mod put_state;

pub use get_state::{GetState, Repair};
pub use proxy::DhtProxy;
pub use put_state::PutState;

/// Progress of one replica stream inside a Get
enum ReplicaEvent {
    Page { replica: usize, entries: Vec<PageEntry> },
    Closed { replica: usize },
}

/// Quorum-replicated access to the DHT
pub struct DhtClient {
    topology: Arc<dyn RingTopology>,
    transport: Arc<dyn DhtTransport>,
    degree: usize,
    online: AtomicBool,
    runtime: Handle,
}

impl DhtClient {
    /// Create an offline client bound to the current Tokio runtime.
    pub fn new(
        topology: Arc<dyn RingTopology>,
        transport: Arc<dyn DhtTransport>,
        degree: usize,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| DhtError::Internal(format!("DHT client needs a runtime: {}", e)))?;
        Ok(Self {
            topology,
            transport,
            degree: degree.max(1),
            online: AtomicBool::new(false),
            runtime,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn majority(&self) -> usize {
        ring::majority(self.degree)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn on_state_changed(&self, state: ConnectionState) {
        let online = match state {
            ConnectionState::Connected => true,
            ConnectionState::Leaving | ConnectionState::Disconnected | ConnectionState::Offline => {
                false
            }
            ConnectionState::Connecting => return,
        };
        if self.online.swap(online, Ordering::SeqCst) != online {
            info!("DHT client is {}", if online { "online" } else { "offline" });
        }
    }

    /// Track the overlay state until the channel or the client goes away.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<OverlayEvent>,
    ) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(OverlayEvent::StateChanged(state)) => match client.upgrade() {
                        Some(client) => client.on_state_changed(state),
                        None => break,
                    },
                    Ok(OverlayEvent::ConnectionsChanged) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(DhtError::Offline)
        }
    }

    /// Start a replicated Get.
    ///
    /// Values arrive on the returned stream as soon as a majority of replicas
    /// confirm them. The stream ends when every replica is done, or earlier
    /// once no further value can reach majority.
    pub fn async_get(&self, key: &[u8]) -> Result<mpsc::UnboundedReceiver<DhtValue>> {
        self.ensure_online()?;
        let positions = ring::replica_positions(key, self.degree);
        let (output, values) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        for (replica, position) in positions.iter().copied().enumerate() {
            let topology = self.topology.clone();
            let transport = self.transport.clone();
            let events = events_tx.clone();
            self.runtime.spawn(async move {
                read_replica(topology, transport, replica, position, events).await;
            });
        }
        drop(events_tx);

        self.runtime.spawn(aggregate_get(
            self.degree,
            positions,
            self.topology.clone(),
            self.transport.clone(),
            events_rx,
            output,
        ));
        Ok(values)
    }

    /// Start a replicated Put; the receiver resolves at the first decisive ack.
    pub fn async_put(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: u64,
        unique: bool,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        self.ensure_online()?;
        if value.len() > crate::types::MAX_VALUE_BYTES {
            return Err(DhtError::ValueTooLarge {
                size: value.len(),
                max: crate::types::MAX_VALUE_BYTES,
            });
        }

        let (result_tx, result_rx) = oneshot::channel();
        let result_tx = Arc::new(Mutex::new(Some(result_tx)));
        let state = Arc::new(Mutex::new(PutState::new(self.degree)));

        for position in ring::replica_positions(key, self.degree) {
            let topology = self.topology.clone();
            let transport = self.transport.clone();
            let state = state.clone();
            let result_tx = result_tx.clone();
            let value = value.clone();
            self.runtime.spawn(async move {
                let accepted =
                    write_replica(&*topology, &*transport, position, value, ttl, unique).await;
                let decision = state.lock().record(accepted);
                if let Some(outcome) = decision {
                    if let Some(tx) = result_tx.lock().take() {
                        let _ = tx.send(outcome);
                    }
                }
            });
        }
        Ok(result_rx)
    }

    /// Every majority-confirmed value of `key`.
    pub async fn get(&self, key: &[u8]) -> Result<Vec<DhtValue>> {
        let mut stream = self.async_get(key)?;
        let mut values = Vec::new();
        while let Some(value) = stream.recv().await {
            values.push(value);
        }
        Ok(values)
    }

    pub async fn put(&self, key: &[u8], value: Bytes, ttl: u64) -> Result<()> {
        let outcome = self.async_put(key, value, ttl, false)?;
        outcome.await.map_err(|_| undecided())?
    }

    /// Put that fails if any other value is already stored under `key`.
    pub async fn create(&self, key: &[u8], value: Bytes, ttl: u64) -> Result<()> {
        let outcome = self.async_put(key, value, ttl, true)?;
        outcome.await.map_err(|_| undecided())?
    }

    /// Blocking [`DhtClient::get`]; must not be called from async code.
    pub fn blocking_get(&self, key: &[u8]) -> Result<Vec<DhtValue>> {
        let mut stream = self.async_get(key)?;
        let mut values = Vec::new();
        while let Some(value) = stream.blocking_recv() {
            values.push(value);
        }
        Ok(values)
    }

    /// Blocking [`DhtClient::put`]; must not be called from async code.
    pub fn blocking_put(&self, key: &[u8], value: Bytes, ttl: u64) -> Result<()> {
        let outcome = self.async_put(key, value, ttl, false)?;
        outcome.blocking_recv().map_err(|_| undecided())?
    }

    /// Blocking [`DhtClient::create`]; must not be called from async code.
    pub fn blocking_create(&self, key: &[u8], value: Bytes, ttl: u64) -> Result<()> {
        let outcome = self.async_put(key, value, ttl, true)?;
        outcome.blocking_recv().map_err(|_| undecided())?
    }
}

fn undecided() -> DhtError {
    DhtError::Internal("Put finished without a decision".to_string())
}

/// Write one replica. Any error or missing node is a negative ack.
async fn write_replica(
    topology: &dyn RingTopology,
    transport: &dyn DhtTransport,
    position: RingPosition,
    value: Bytes,
    ttl: u64,
    unique: bool,
) -> bool {
    let Some(node) = topology.closest_node(position) else {
        return false;
    };
    let key = Bytes::copy_from_slice(&position.to_key_bytes());
    match transport.put(&node, key, value, ttl, unique).await {
        Ok(accepted) => accepted,
        Err(e) => {
            debug!("Replica write at {} via {} failed: {}", position, node.id, e);
            false
        }
    }
}

/// Page through one replica, always against the node first resolved for it.
async fn read_replica(
    topology: Arc<dyn RingTopology>,
    transport: Arc<dyn DhtTransport>,
    replica: usize,
    position: RingPosition,
    events: mpsc::UnboundedSender<ReplicaEvent>,
) {
    if let Some(node) = topology.closest_node(position) {
        let key = Bytes::copy_from_slice(&position.to_key_bytes());
        let mut token = None;
        loop {
            let page = match transport.get(&node, key.clone(), token.take()).await {
                Ok(page) => page,
                Err(e) => {
                    debug!("Replica {} read via {} failed: {}", replica, node.id, e);
                    break;
                }
            };
            let more = page.remaining > 0 && page.token.is_some();
            token = page.token;
            if events
                .send(ReplicaEvent::Page {
                    replica,
                    entries: page.entries,
                })
                .is_err()
                || !more
            {
                break;
            }
        }
    }
    let _ = events.send(ReplicaEvent::Closed { replica });
}

async fn aggregate_get(
    degree: usize,
    positions: Vec<RingPosition>,
    topology: Arc<dyn RingTopology>,
    transport: Arc<dyn DhtTransport>,
    mut events: mpsc::UnboundedReceiver<ReplicaEvent>,
    output: mpsc::UnboundedSender<DhtValue>,
) {
    let mut state = GetState::new(degree);
    let mut output = Some(output);

    while let Some(event) = events.recv().await {
        match event {
            ReplicaEvent::Page { replica, entries } => {
                for value in state.record_page(replica, entries) {
                    if let Some(out) = &output {
                        // a caller that stopped listening still gets its holes repaired
                        let _ = out.send(value);
                    }
                }
            }
            ReplicaEvent::Closed { replica } => {
                if state.close_replica(replica) && output.take().is_some() {
                    debug!("Closing Get stream early, no pending value can reach majority");
                }
                if state.all_closed() {
                    break;
                }
            }
        }
    }
    drop(output);

    for repair in state.repairs() {
        for replica in repair.missing {
            let position = positions[replica];
            let topology = topology.clone();
            let transport = transport.clone();
            let value = repair.value.clone();
            let ttl = repair.ttl;
            tokio::spawn(async move {
                if write_replica(&*topology, &*transport, position, value, ttl, false).await {
                    debug!("Repaired replica {} at {}", replica, position);
                } else {
                    warn!("Hole repair of replica {} at {} failed", replica, position);
                }
            });
        }
    }
}
