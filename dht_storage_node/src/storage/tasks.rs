// Background maintenance for the local store
//
// Expired versions are normally purged when their key is touched. The sweep
// catches keys nobody reads again.

use super::local_store::LocalStore;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

/// Periodically purges expired versions from a store
pub struct ExpirySweeper {
    store: Arc<Mutex<LocalStore>>,
    period: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<Mutex<LocalStore>>, period: Duration) -> Self {
        Self { store, period }
    }

    /// Purge once and report how many versions went away.
    pub fn sweep_once(&self) -> usize {
        let purged = self.store.lock().sweep_at(Utc::now());
        if purged > 0 {
            info!("Expiry sweep purged {} entries", purged);
        } else {
            debug!("Expiry sweep found nothing to purge");
        }
        purged
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                self.sweep_once();
            }
        })
    }
}
