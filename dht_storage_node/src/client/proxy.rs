// Keeps registered key/value pairs alive in the DHT
//
// Each registration is written right away and then re-written every half
// TTL. A failed write is retried on a shorter fixed interval.

use super::DhtClient;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A registration as reported by [`DhtProxy::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    #[serde(with = "crate::types::wire::base64_bytes")]
    pub key: Bytes,
    #[serde(with = "crate::types::wire::base64_bytes")]
    pub value: Bytes,
    pub ttl: u64,
}

struct Active {
    ttl: u64,
    task: JoinHandle<()>,
}

pub struct DhtProxy {
    client: Arc<DhtClient>,
    retry: Duration,
    active: Mutex<HashMap<(Bytes, Bytes), Active>>,
}

impl DhtProxy {
    pub fn new(client: Arc<DhtClient>, retry: Duration) -> Self {
        Self {
            client,
            retry,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start refreshing `(key, value)`. Replaces an earlier registration of
    /// the same pair and returns whether one existed.
    pub fn register(&self, key: Bytes, value: Bytes, ttl: u64) -> bool {
        let task = tokio::spawn(refresh_loop(
            self.client.clone(),
            key.clone(),
            value.clone(),
            ttl,
            self.retry,
        ));
        let previous = self.active.lock().insert((key, value), Active { ttl, task });
        match previous {
            Some(previous) => {
                previous.task.abort();
                true
            }
            None => false,
        }
    }

    /// Stop refreshing `(key, value)`; the stored copies expire on their own.
    pub fn unregister(&self, key: &Bytes, value: &Bytes) -> bool {
        let removed = self.active.lock().remove(&(key.clone(), value.clone()));
        match removed {
            Some(active) => {
                active.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<Registration> {
        self.active
            .lock()
            .iter()
            .map(|((key, value), active)| Registration {
                key: key.clone(),
                value: value.clone(),
                ttl: active.ttl,
            })
            .collect()
    }
}

impl Drop for DhtProxy {
    fn drop(&mut self) {
        for (_, active) in self.active.lock().drain() {
            active.task.abort();
        }
    }
}

async fn refresh_loop(client: Arc<DhtClient>, key: Bytes, value: Bytes, ttl: u64, retry: Duration) {
    let refresh = Duration::from_secs((ttl / 2).max(1));
    loop {
        let wait = match client.put(&key, value.clone(), ttl).await {
            Ok(()) => {
                debug!("Refreshed registration for key {}", hex::encode(&key));
                refresh
            }
            Err(e) => {
                warn!(
                    "Registration put for key {} failed, retrying in {:?}: {}",
                    hex::encode(&key),
                    retry,
                    e
                );
                retry
            }
        };
        tokio::time::sleep(wait).await;
    }
}

impl std::fmt::Debug for DhtProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtProxy")
            .field("registrations", &self.active.lock().len())
            .finish()
    }
}
