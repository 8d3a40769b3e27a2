/// # DHT Storage Node
///
/// Entry point of a single DHT node. It loads the configuration, joins the
/// configured peers into the membership table, wires the service endpoint,
/// the replication client and the registration proxy together, and serves
/// the HTTP API.
///
/// ## Configuration
///
/// The node is configured via a TOML file that specifies:
/// * Node identity, ring address and public endpoint
/// * API bind address
/// * Replication degree and migration parallelism
/// * Static peers
///
/// Any value can be overridden with `DHT__SECTION__KEY` environment variables.
///
/// ## Usage
///
/// ```bash
/// # Write a default configuration
/// dht-storage-node --config node.toml init
///
/// # Run the node
/// dht-storage-node --config node.toml
/// ```
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dht_storage_node::api::{ApiServer, AppState};
use dht_storage_node::client::{DhtClient, DhtProxy};
use dht_storage_node::config::{ensure_default_config, Config};
use dht_storage_node::network::HttpTransport;
use dht_storage_node::ring::{ConnectionState, MembershipTable};
use dht_storage_node::storage::DhtService;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments of the DHT node.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Write a default configuration file if none exists and exit
    Init,
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    if let Some(Commands::Init) = cli.command {
        let config = ensure_default_config(&cli.config)
            .with_context(|| format!("writing {:?}", cli.config))?;
        println!("Configuration for node {} at {:?}", config.node.id, cli.config);
        return Ok(());
    }

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", cli.config, e);
            process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Configuration loaded from {:?}", cli.config);

    if let Err(e) = run(config).await {
        error!("Node stopped: {:#}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let local = config.local_node()?;
    info!("Local node {} at ring address {}", local.id, local.address);

    let membership = Arc::new(MembershipTable::new(local));
    for peer in config.peer_nodes()? {
        if !membership.add_peer(peer.clone()) {
            warn!("Ignoring peer {} with the local node's id", peer.id);
        }
    }

    let transport = Arc::new(HttpTransport::new(config.dht.rpc_timeout())?);
    let service = Arc::new(DhtService::new(
        membership.clone(),
        transport.clone(),
        config.dht.max_parallel_transfers,
    ));
    let client = Arc::new(DhtClient::new(
        membership.clone(),
        transport,
        config.degree(),
    )?);

    service.spawn_event_loop(membership.subscribe());
    client.spawn_event_loop(membership.subscribe());
    service.spawn_sweeper(config.dht.sweep_interval());

    // static membership: the node counts as connected once its peers are known
    membership.set_state(ConnectionState::Connected);

    let proxy = Arc::new(DhtProxy::new(client.clone(), config.dht.proxy_retry()));
    let state = Arc::new(AppState {
        service,
        client,
        proxy,
        membership,
    });

    info!(
        "DHT node running with degree {}. Press Ctrl+C to stop.",
        config.degree()
    );
    ApiServer::new(state, config.api.bind_address.clone())
        .start()
        .await
        .context("API server failed")?;

    Ok(())
}
