// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Runs a group of Reliquary nodes over the in-memory transport and reports how their blocks
//! spread

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use reliquary::{Collaborators, Engine};
use reliquary_example_types::{
    network_types::{MasterMap, MemoryNetwork},
    node_types::MemoryImpl,
    storage_types::{MemoryBackupLedger, MemoryCertificateStore, MemoryContentStore},
};
use reliquary_types::{
    data::{ContentHash, JournalEntry, PeerCertificate},
    engine_config_file::EngineConfigFile,
    logging::setup_logging,
    traits::{ContentStore, Transport},
    EngineConfig,
};
use tracing::{info, warn};

/// Simulates a group of storage contract nodes on one machine
#[derive(Parser, Debug, Clone)]
#[command(name = "reliquary-simulator", about = "Runs in-memory Reliquary nodes")]
struct Args {
    /// TOML engine configuration shared by every node
    #[arg(long = "config", env = "RELIQUARY_CONFIG")]
    config: Option<PathBuf>,

    /// The number of nodes to start
    #[arg(long, default_value_t = 4)]
    nodes: u64,

    /// Files each node backs up
    #[arg(long, default_value_t = 8)]
    files_per_node: usize,

    /// Size of each file in bytes
    #[arg(long, default_value_t = 4096)]
    file_size: usize,

    /// Contract cycle and gatekeeper interval in milliseconds, overriding the configuration
    #[arg(long, default_value_t = 500)]
    cycle_millis: u64,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Seed for node identities and file contents
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// A simulated node
struct SimNode {
    /// Its engine
    engine: Engine<MemoryImpl>,
    /// Its transport
    network: Arc<MemoryNetwork>,
    /// Blocks it holds for others
    block_store: Arc<MemoryContentStore>,
}

/// The configuration every node runs with
fn engine_config(args: &Args) -> Result<EngineConfig> {
    let file = match &args.config {
        Some(path) => EngineConfigFile::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfigFile::default(),
    };
    let mut config: EngineConfig = file.into();
    if config.shared_passphrase.is_empty() {
        config.shared_passphrase = "reliquary simulator".to_string();
    }
    let cycle = Duration::from_millis(args.cycle_millis.max(1));
    config.contract_update_interval = cycle;
    config.gatekeeper_interval = cycle;
    config.uptime_tick_interval = cycle;
    config.max_tick_gap = cycle * 3;
    config.bootstrap_grace = Duration::ZERO;
    config.bootstrap_ramp_up = Duration::ZERO;
    Ok(config)
}

/// Listening address of node `index`
fn address(index: u64) -> SocketAddr {
    let port = 30_000 + u16::try_from(index % 30_000).unwrap_or(0);
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Create node `index` with its files already backed up locally
async fn spawn_node(
    index: u64,
    args: &Args,
    config: &EngineConfig,
    master_map: &Arc<MasterMap>,
    rng: &mut SmallRng,
) -> Result<SimNode> {
    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&args.seed.to_le_bytes());
    let certificate = PeerCertificate::generated_from_seed_indexed(seed, index);
    let network = MemoryNetwork::new(certificate.clone(), Some(address(index)), master_map);
    let shard_store = Arc::new(MemoryContentStore::new(u64::MAX));
    let block_store = Arc::new(MemoryContentStore::new(u64::MAX));
    let backup = Arc::new(MemoryBackupLedger::default());

    for file in 0..args.files_per_node {
        let mut content = vec![0u8; args.file_size];
        rng.fill_bytes(&mut content);
        let hash = ContentHash::of(&content);
        shard_store.store(hash, content).await?;
        backup
            .record(JournalEntry {
                path: format!("node-{index}/file-{file}.bin"),
                version: 1,
                modified: certificate.issued_at,
                shards: vec![hash],
            })
            .await;
    }

    let collaborators = Collaborators::<MemoryImpl> {
        transport: Arc::clone(&network),
        shard_store,
        block_store: Arc::clone(&block_store),
        backup,
        certificates: Arc::new(MemoryCertificateStore::new(config.max_connections.max(1))),
    };
    let engine = Engine::init(certificate.peer_id(), config.clone(), collaborators).await?;
    Ok(SimNode {
        engine,
        network,
        block_store,
    })
}

/// Log what every node has placed, holds and can prove
async fn report(nodes: &[SimNode]) {
    for node in nodes {
        let manager = node.engine.manager();
        info!(
            node = %manager.my_id(),
            contracted = manager.contracts().contracted_count(),
            placed = manager.contracts().get_my_block_ids(None).len(),
            held = node.block_store.list().await.len(),
            proven = manager.evidence().len(),
            "node summary"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let args = Args::parse();
    let config = engine_config(&args)?;
    info!(?args, "Starting simulation");

    let master_map = MasterMap::new();
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let mut nodes = Vec::new();
    for index in 0..args.nodes {
        nodes.push(spawn_node(index, &args, &config, &master_map, &mut rng).await?);
    }
    for node in &mut nodes {
        node.engine.start();
    }

    // a ring is enough, peer exchange does the rest
    for (index, node) in nodes.iter().enumerate() {
        let next = u64::try_from(index + 1).unwrap_or(0) % args.nodes.max(1);
        if next == u64::try_from(index).unwrap_or(0) {
            continue;
        }
        if let Err(e) = node.network.connect(address(next)).await {
            warn!("Node {index} could not reach node {next}: {e}");
        }
    }

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("Interrupted");
        }
    }

    report(&nodes).await;
    for node in &mut nodes {
        node.engine.shut_down().await?;
    }
    Ok(())
}
