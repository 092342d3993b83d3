//! Thronglet Daemon - runs one node on the local network
//!
//! Loads an optional JSON config, applies command-line overrides, binds the
//! discovery and reliable sockets, and runs the node until Ctrl-C. With a
//! data directory the population survives restarts.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thronglet_core::{JsonFileStore, JsonLinesMigrationLog, Node, NodeConfig, SnapshotStore};
use thronglet_env::{NodeId, TokioContext, TokioTransport};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Thronglet node daemon
#[derive(Parser, Debug, Default)]
#[command(name = "throngletd")]
#[command(about = "Run a Thronglet node", long_about = None)]
struct Args {
    /// JSON config file; every field is optional
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Master seed (overrides the config file)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Directory for snapshots and the migration log
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    bind_ip: Option<IpAddr>,

    #[arg(long)]
    discovery_port: Option<u16>,

    #[arg(long)]
    comm_port: Option<u16>,

    /// Creatures to spawn when nothing was restored
    #[arg(long, default_value = "3")]
    creatures: usize,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Reads the config file (or defaults) and applies flag overrides.
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => NodeConfig::default(),
        };

        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(ip) = self.bind_ip {
            config.bind_ip = ip;
        }
        if let Some(port) = self.discovery_port {
            config.discovery_port = port;
        }
        if let Some(port) = self.comm_port {
            config.comm_port = port;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Identity of this node: kept from a previous snapshot, else from the seed.
fn node_identity(config: &NodeConfig, store: Option<&JsonFileStore>) -> NodeId {
    if let Some(store) = store {
        match store.load() {
            Ok(Some(snapshot)) => return snapshot.node_id,
            Ok(None) => {}
            Err(e) => warn!("Could not read snapshot for node identity: {}", e),
        }
    }
    match config.seed {
        Some(seed) => NodeId::from_seed(seed),
        None => NodeId::new(),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.node_config()?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    init_logging(args.verbose);

    let context = Arc::new(match config.seed {
        Some(seed) => TokioContext::seeded(seed),
        None => TokioContext::new(),
    });
    let transport = TokioTransport::bind(config.transport_config())
        .await
        .with_context(|| {
            format!(
                "failed to bind {} (discovery {}, comm {})",
                config.bind_ip, config.discovery_port, config.comm_port
            )
        })?;

    let store = config.data_dir.as_deref().map(JsonFileStore::new);
    let node_id = node_identity(&config, store.as_ref());
    let data_dir = config.data_dir.clone();

    let mut node = Node::new(node_id, config, context, Arc::new(transport)).context("failed to build node")?;
    if let Some(store) = store {
        node = node.with_snapshot_store(Arc::new(store));
    }
    if let Some(dir) = &data_dir {
        let log = JsonLinesMigrationLog::open(dir)
            .with_context(|| format!("failed to open migration log in {}", dir.display()))?;
        node = node.with_migration_log(Arc::new(log));
    }

    let node = Arc::new(node);
    let handle = node.start().context("failed to start node")?;

    // Fresh nodes start with a small population
    if node.list_agents().is_empty() {
        for _ in 0..args.creatures {
            match node.add_agent(None) {
                Ok(creature) => info!("🐣 Spawned {}", creature.name),
                Err(e) => {
                    warn!("Could not spawn initial creature: {}", e);
                    break;
                }
            }
        }
    }

    info!("Thronglet node {} running; press Ctrl-C to stop", node.node_id());
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    let status = node.get_status();
    info!(
        "Stopping with {} creatures after {} ticks",
        status.population, status.tick_count
    );
    handle.shutdown().await;
    Ok(())
}
