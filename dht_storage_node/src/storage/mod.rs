//! # Storage Module for the DHT Storage Node
//!
//! Server side of the DHT: the versioned in-memory store, the service
//! endpoint that other nodes and clients call, and the migration machinery
//! that hands key ranges to new neighbors.
//!
//! * `LocalStore`: per-key version lists ordered by expiry, paginated reads
//! * `DhtService`: Put/PutApply/Get with one redundant neighbor write and
//!   churn-driven migration
//! * `TransferState`: bounded-parallel push of a key range to a neighbor
//! * `ExpirySweeper`: periodic purge of expired versions

pub mod local_store;
pub mod service;
pub mod tasks;
pub mod transfer;

pub use local_store::{ContinuationToken, LocalStore, PutOutcome};
pub use service::{DhtService, NeighborPhase, Side};
pub use tasks::ExpirySweeper;
pub use transfer::{TransferProgress, TransferReport, TransferState};
