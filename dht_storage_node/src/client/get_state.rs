// Vote bookkeeping for one replicated Get
//
// Owned by the single task aggregating replica replies, so no locking.

use crate::types::wire::PageEntry;
use crate::types::DhtValue;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct Votes {
    replicas: BTreeSet<usize>,
    ttl_sum: u64,
    age_sum: u64,
}

/// A majority-confirmed value some replicas did not report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub value: Bytes,
    /// Replica indices missing the value
    pub missing: Vec<usize>,
    /// TTL averaged over the confirming replicas
    pub ttl: u64,
}

/// Per-request aggregation of replica replies
#[derive(Debug)]
pub struct GetState {
    degree: usize,
    majority: usize,
    open: usize,
    closed: BTreeSet<usize>,
    votes: HashMap<Bytes, Votes>,
}

impl GetState {
    pub fn new(degree: usize) -> Self {
        Self {
            degree,
            majority: crate::ring::majority(degree),
            open: degree,
            closed: BTreeSet::new(),
            votes: HashMap::new(),
        }
    }

    /// Count one page from `replica`; returns the values that just reached majority.
    pub fn record_page(&mut self, replica: usize, entries: Vec<PageEntry>) -> Vec<DhtValue> {
        let mut confirmed = Vec::new();
        for entry in entries {
            let votes = self.votes.entry(entry.value.clone()).or_default();
            if !votes.replicas.insert(replica) {
                continue;
            }
            votes.ttl_sum = votes.ttl_sum.saturating_add(entry.ttl);
            votes.age_sum = votes.age_sum.saturating_add(entry.age);
            if votes.replicas.len() == self.majority {
                confirmed.push(DhtValue {
                    value: entry.value,
                    ttl: votes.ttl_sum / self.majority as u64,
                    age: votes.age_sum / self.majority as u64,
                });
            }
        }
        confirmed
    }

    /// Mark `replica` as finished. Returns true when the caller's stream can
    /// be closed early because nothing pending can still reach majority.
    pub fn close_replica(&mut self, replica: usize) -> bool {
        if !self.closed.insert(replica) {
            return false;
        }
        self.open = self.open.saturating_sub(1);
        self.can_leave_early()
    }

    fn can_leave_early(&self) -> bool {
        if self.open >= self.majority {
            return false;
        }
        !self.votes.values().any(|votes| {
            let count = votes.replicas.len();
            count < self.majority && count + self.open >= self.majority
        })
    }

    pub fn all_closed(&self) -> bool {
        self.open == 0
    }

    /// Values confirmed by a majority but not by every replica.
    pub fn repairs(&self) -> Vec<Repair> {
        self.votes
            .iter()
            .filter(|(_, votes)| {
                let count = votes.replicas.len();
                count >= self.majority && count < self.degree
            })
            .map(|(value, votes)| Repair {
                value: value.clone(),
                missing: (0..self.degree)
                    .filter(|index| !votes.replicas.contains(index))
                    .collect(),
                ttl: votes.ttl_sum / votes.replicas.len() as u64,
            })
            .collect()
    }
}
