// DHT Storage Node
//
// This crate implements a replicated key/value storage layer on top of a
// structured ring overlay. Every node runs a local versioned store, answers
// Put/Get requests from other nodes, keeps one redundant copy of each write
// on a structured neighbor, and hands key ranges over when neighbors change.
//
// # Architecture
//
// * **Ring**: 128-bit ring addresses, replica placement and the membership
//   table that feeds neighbor changes to the rest of the node
// * **Storage**: the local store and the service endpoint with its
//   churn-driven migration
// * **Client**: quorum reads and writes over `2^k` replica positions
// * **Network**: the node-to-node RPC transport (HTTP or in-process)
// * **API Layer**: axum routes exposing all of the above
//
// # Usage
//
// ```rust,no_run
// use dht_storage_node::client::DhtClient;
// use dht_storage_node::network::HttpTransport;
// use dht_storage_node::ring::{ConnectionState, MembershipTable};
// use dht_storage_node::types::NodeInfo;
// use std::sync::Arc;
// use std::time::Duration;
//
// async fn example() -> Result<(), Box<dyn std::error::Error>> {
//     let table = Arc::new(MembershipTable::new(NodeInfo::new("n1", "http://127.0.0.1:8080")));
//     let transport = Arc::new(HttpTransport::new(Duration::from_secs(30))?);
//     let client = Arc::new(DhtClient::new(table.clone(), transport, 4)?);
//     client.on_state_changed(ConnectionState::Connected);
//
//     client.put(b"my_key", "Hello, DHT!".into(), 600).await?;
//     let values = client.get(b"my_key").await?;
//     println!("Retrieved {} value(s)", values.len());
//     Ok(())
// }
// ```
//
// # Modules Overview

/// HTTP API of a DHT node.
///
/// Node-to-node RPC routes, the quorum client routes, and a small
/// administration surface for status and membership.
pub mod api;

/// Replication client.
///
/// Maps a key to `2^k` replica positions, aggregates replica reads into
/// majority-confirmed values, counts write acks, and repairs replicas that
/// missed a confirmed value.
///
/// # Examples
///
/// ```rust,no_run
/// use dht_storage_node::client::DhtClient;
///
/// async fn read(client: &DhtClient) -> dht_storage_node::error::Result<()> {
///     for value in client.get(b"my_key").await? {
///         println!("{} bytes, {}s left", value.value.len(), value.ttl);
///     }
///     Ok(())
/// }
/// ```
pub mod client;

/// Node configuration loaded from TOML with environment overrides.
pub mod config;

/// Error types for the DHT node.
///
/// A single `DhtError` flows through the store, service, transport and
/// client, and maps onto HTTP status codes at the API boundary.
pub mod error;

/// Node-to-node transport.
///
/// # Features
///
/// * `DhtTransport` trait for Put, PutApply, Get, Dump and Count
/// * HTTP transport over reqwest with a per-call timeout
/// * In-process transport for single-process clusters
pub mod network;

/// Ring addressing and membership.
pub mod ring;

/// Server side of the DHT: local store, service endpoint and migration.
pub mod storage;

/// Shared data types and wire messages.
pub mod types;

pub use error::{DhtError, Result};
