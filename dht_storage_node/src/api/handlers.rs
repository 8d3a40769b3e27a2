// API handlers for the DHT storage node
//
// This module implements the API route handlers for the storage node.

use crate::api::AppState;
use crate::client::proxy::Registration;
use crate::error::{DhtError, Result};
use crate::ring::{ConnectionState, RingTopology};
use crate::storage::{NeighborPhase, Side};
use crate::types::wire::{
    BoolReply, ClientGetRequest, ClientPutRequest, CountReply, DumpEntry, GetPage, GetRequest,
    PutRequest,
};
use crate::types::{DhtValue, NodeInfo};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Node status
#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub node: NodeInfo,
    pub state: ConnectionState,
    pub online: bool,
    pub left: NeighborPhase,
    pub right: NeighborPhase,
    pub entries: usize,
    pub degree: usize,
    pub peers: usize,
}

/// Body of `POST /admin/state`
#[derive(Debug, Deserialize)]
pub struct SetStateRequest {
    pub state: ConnectionState,
}

/// Body of the registration routes
#[derive(Debug, Deserialize)]
pub struct RegistrationRequest {
    #[serde(with = "crate::types::wire::base64_bytes")]
    pub key: bytes::Bytes,
    #[serde(with = "crate::types::wire::base64_bytes")]
    pub value: bytes::Bytes,
    #[serde(default)]
    pub ttl: u64,
}

/// Node-to-node Put: store and forward to the redundant neighbor
pub async fn dht_put(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PutRequest>,
) -> Result<Json<BoolReply>> {
    debug!("Put of {} bytes", request.value.len());
    let result = state
        .service
        .put(request.key, request.value, request.ttl, request.unique)
        .await?;
    Ok(Json(BoolReply { result }))
}

/// Node-to-node PutApply: store locally only
pub async fn dht_put_apply(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PutRequest>,
) -> Result<Json<BoolReply>> {
    let result = state
        .service
        .put_apply(request.key, request.value, request.ttl, request.unique)
        .await?;
    Ok(Json(BoolReply { result }))
}

pub async fn dht_get(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GetRequest>,
) -> Result<Json<GetPage>> {
    let page = state.service.get(request.key, request.token).await?;
    Ok(Json(page))
}

pub async fn dht_dump(State(state): State<Arc<AppState>>) -> Json<Vec<DumpEntry>> {
    Json(state.service.dump())
}

pub async fn dht_count(State(state): State<Arc<AppState>>) -> Json<CountReply> {
    Json(CountReply {
        count: state.service.count(),
    })
}

/// Replicated put
pub async fn client_put(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClientPutRequest>,
) -> Result<Json<BoolReply>> {
    state
        .client
        .put(&request.key, request.value, request.ttl)
        .await?;
    Ok(Json(BoolReply { result: true }))
}

/// Replicated create-only put
pub async fn client_create(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClientPutRequest>,
) -> Result<Json<BoolReply>> {
    state
        .client
        .create(&request.key, request.value, request.ttl)
        .await?;
    Ok(Json(BoolReply { result: true }))
}

/// Replicated get
pub async fn client_get(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClientGetRequest>,
) -> Result<Json<Vec<DhtValue>>> {
    let values = state.client.get(&request.key).await?;
    Ok(Json(values))
}

pub async fn list_registrations(State(state): State<Arc<AppState>>) -> Json<Vec<Registration>> {
    Json(state.proxy.list())
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegistrationRequest>,
) -> Result<impl IntoResponse> {
    if request.ttl == 0 {
        return Err(DhtError::InvalidRequest("Registration needs a positive ttl".to_string()));
    }
    let replaced = state.proxy.register(request.key, request.value, request.ttl);
    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok(status)
}

pub async fn unregister(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegistrationRequest>,
) -> Result<impl IntoResponse> {
    if state.proxy.unregister(&request.key, &request.value) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(DhtError::NotFound("No such registration".to_string()))
    }
}

pub async fn node_status(State(state): State<Arc<AppState>>) -> Json<NodeStatus> {
    Json(NodeStatus {
        node: state.membership.local_node(),
        state: state.membership.state(),
        online: state.service.is_online(),
        left: state.service.neighbor_phase(Side::Left),
        right: state.service.neighbor_phase(Side::Right),
        entries: state.service.count(),
        degree: state.client.degree(),
        peers: state.membership.peers().len(),
    })
}

pub async fn add_peer(
    State(state): State<Arc<AppState>>,
    Json(node): Json<NodeInfo>,
) -> Result<impl IntoResponse> {
    info!("Adding peer {} at {}", node.id, node.address);
    if state.membership.add_peer(node) {
        Ok(StatusCode::CREATED)
    } else {
        Err(DhtError::InvalidRequest("Cannot add the local node as a peer".to_string()))
    }
}

pub async fn remove_peer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    match state.membership.remove_peer(&id) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(DhtError::NotFound(format!("Unknown peer: {}", id))),
    }
}

pub async fn set_state(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetStateRequest>,
) -> impl IntoResponse {
    state.membership.set_state(request.state);
    StatusCode::NO_CONTENT
}
