// DHT Storage Node API Module
//
// This module implements the HTTP surface of a node. It serves three groups
// of routes:
//
// * **Node-to-node RPC** (`/dht/*`): Put, PutApply, Get, Dump and Count
//   against the local service endpoint
// * **Client API** (`/client/*`): quorum-replicated get/put/create and
//   registrations kept alive by the proxy
// * **Administration** (`/status`, `/admin/*`): node status and manual
//   control of the membership table
//
// # Using the API with curl
//
// ```bash
// # Store a value (key and value are base64)
// curl -X POST -H "Content-Type: application/json" \
//      -d '{"key":"a2V5","value":"dmFsdWU=","ttl":600}' http://localhost:8080/client/put
//
// # Read it back
// curl -X POST -H "Content-Type: application/json" -d '{"key":"a2V5"}' http://localhost:8080/client/get
// ```

use crate::client::{DhtClient, DhtProxy};
use crate::error::{DhtError, Result};
use crate::ring::MembershipTable;
use crate::storage::DhtService;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

mod handlers;

pub use handlers::*;

/// Application state shared with all routes.
#[derive(Clone)]
pub struct AppState {
    /// Local DHT service endpoint
    pub service: Arc<DhtService>,
    /// Replication client used by the client routes
    pub client: Arc<DhtClient>,
    /// Registrations kept alive on behalf of clients
    pub proxy: Arc<DhtProxy>,
    /// Membership table driving the ring topology
    pub membership: Arc<MembershipTable>,
}

/// HTTP server of one DHT node
pub struct ApiServer {
    /// Application state shared with all request handlers
    app_state: Arc<AppState>,
    /// Server bind address in the format "IP:port"
    bind_address: String,
}

impl ApiServer {
    pub fn new(app_state: Arc<AppState>, bind_address: String) -> Self {
        Self {
            app_state,
            bind_address,
        }
    }

    /// Bind the configured address and serve until the server stops.
    pub async fn start(&self) -> Result<()> {
        let app = router(self.app_state.clone());

        let addr: SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| DhtError::Config(format!("Invalid bind address: {}", e)))?;

        info!("Starting API server on {}", self.bind_address);

        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .await
            .map_err(|e| DhtError::Network(format!("Server error: {}", e)))?;

        Ok(())
    }
}

/// All routes of a node, wrapped in request tracing.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Node-to-node RPC
        .route("/dht/put", post(handlers::dht_put))
        .route("/dht/put_apply", post(handlers::dht_put_apply))
        .route("/dht/get", post(handlers::dht_get))
        .route("/dht/dump", get(handlers::dht_dump))
        .route("/dht/count", get(handlers::dht_count))
        // Client API
        .route("/client/put", post(handlers::client_put))
        .route("/client/create", post(handlers::client_create))
        .route("/client/get", post(handlers::client_get))
        .route(
            "/client/registrations",
            get(handlers::list_registrations)
                .post(handlers::register)
                .delete(handlers::unregister),
        )
        // Administration
        .route("/status", get(handlers::node_status))
        .route("/admin/peers", post(handlers::add_peer))
        .route("/admin/peers/:id", delete(handlers::remove_peer))
        .route("/admin/state", post(handlers::set_state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
