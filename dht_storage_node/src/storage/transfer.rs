// Migration of a key range to a newly observed neighbor
//
// A transfer owns a worklist of entry snapshots and pushes them to the
// neighbor with a bounded number of PutApply calls in flight. Interrupting
// stops new launches; calls already in flight run to completion.

use crate::network::DhtTransport;
use crate::types::{Entry, NodeInfo};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome counters of one migration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Entries in the initial worklist
    pub total: usize,
    /// Accepted by the neighbor
    pub sent: usize,
    /// Rejected or unreachable; dropped from this pass
    pub failed: usize,
    /// Expired before their turn came
    pub skipped_expired: usize,
    pub interrupted: bool,
    pub finished: bool,
}

/// Handle for observing a running migration
#[derive(Debug, Clone)]
pub struct TransferProgress {
    rx: watch::Receiver<TransferReport>,
}

impl TransferProgress {
    /// Wait until the migration has drained its in-flight calls.
    pub async fn finished(mut self) -> TransferReport {
        if let Ok(report) = self.rx.wait_for(|report| report.finished).await {
            return report.clone();
        }
        // sender gone without finishing
        self.rx.borrow().clone()
    }
}

/// One migration towards one neighbor
pub struct TransferState {
    neighbor: NodeInfo,
    interrupted: Arc<AtomicBool>,
    worklist: Arc<Mutex<VecDeque<Entry>>>,
    progress: watch::Receiver<TransferReport>,
    _task: JoinHandle<()>,
}

impl TransferState {
    /// Start pushing `entries` to `neighbor` on the current runtime.
    pub fn start(
        neighbor: NodeInfo,
        entries: Vec<Entry>,
        transport: Arc<dyn DhtTransport>,
        max_parallel: usize,
    ) -> Self {
        let report = TransferReport {
            total: entries.len(),
            ..TransferReport::default()
        };
        let (tx, rx) = watch::channel(report.clone());
        let interrupted = Arc::new(AtomicBool::new(false));
        let worklist = Arc::new(Mutex::new(VecDeque::from(entries)));

        info!(
            "Starting transfer of {} entries to {}",
            report.total, neighbor.id
        );

        let task = tokio::spawn(run_transfer(
            neighbor.clone(),
            worklist.clone(),
            interrupted.clone(),
            transport,
            max_parallel.max(1),
            report,
            tx,
        ));

        Self {
            neighbor,
            interrupted,
            worklist,
            progress: rx,
            _task: task,
        }
    }

    /// Stop launching new PutApply calls and drop the unsent remainder.
    pub fn interrupt(&self) {
        if !self.interrupted.swap(true, Ordering::SeqCst) {
            let dropped = {
                let mut worklist = self.worklist.lock();
                let dropped = worklist.len();
                worklist.clear();
                dropped
            };
            debug!(
                "Interrupted transfer to {}, {} entries left unsent",
                self.neighbor.id, dropped
            );
        }
    }

    pub fn is_finished(&self) -> bool {
        self.progress.borrow().finished
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            rx: self.progress.clone(),
        }
    }
}

async fn run_transfer(
    neighbor: NodeInfo,
    worklist: Arc<Mutex<VecDeque<Entry>>>,
    interrupted: Arc<AtomicBool>,
    transport: Arc<dyn DhtTransport>,
    max_parallel: usize,
    mut report: TransferReport,
    tx: watch::Sender<TransferReport>,
) {
    let mut in_flight = FuturesUnordered::new();

    loop {
        while in_flight.len() < max_parallel && !interrupted.load(Ordering::SeqCst) {
            let Some(entry) = worklist.lock().pop_front() else {
                break;
            };
            let ttl = entry.remaining_ttl_at(Utc::now());
            if ttl == 0 {
                report.skipped_expired += 1;
                continue;
            }
            let transport = transport.clone();
            let neighbor = neighbor.clone();
            in_flight.push(async move {
                let result = transport
                    .put_apply(&neighbor, entry.key.clone(), entry.value.clone(), ttl, false)
                    .await;
                (entry, result)
            });
        }

        let Some((entry, result)) = in_flight.next().await else {
            break;
        };
        match result {
            Ok(true) => report.sent += 1,
            Ok(false) => {
                report.failed += 1;
                warn!(
                    "Neighbor {} refused migrated entry for key {}",
                    neighbor.id,
                    hex::encode(&entry.key)
                );
            }
            Err(e) => {
                report.failed += 1;
                warn!(
                    "Failed to migrate key {} to {}: {}",
                    hex::encode(&entry.key),
                    neighbor.id,
                    e
                );
            }
        }
        tx.send_replace(report.clone());
    }

    report.interrupted = interrupted.load(Ordering::SeqCst);
    report.finished = true;
    info!(
        "Transfer to {} done: sent {}, failed {}, expired {}, interrupted {}",
        neighbor.id, report.sent, report.failed, report.skipped_expired, report.interrupted
    );
    tx.send_replace(report);
}
