// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Types and Traits for the `Reliquary` storage contract engine
#![warn(
    clippy::all,
    clippy::pedantic,
    rust_2018_idioms,
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::panic
)]
#![allow(clippy::module_name_repetitions)]

use std::{net::SocketAddr, path::PathBuf, time::Duration};

pub mod constants;
pub mod data;
pub mod engine_config_file;
pub mod error;
pub mod logging;
pub mod message;
pub mod temporal;
pub mod traits;
pub mod utils;

/// Holds configuration for a `Reliquary` engine
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Passphrase the symmetric block key is derived from
    pub shared_passphrase: String,
    /// How often contract updates are sent to every contracted, connected peer
    pub contract_update_interval: Duration,
    /// How often the local uptime calculator is advanced
    pub uptime_tick_interval: Duration,
    /// Uptime gaps longer than this are not credited, the node was not running
    pub max_tick_gap: Duration,
    /// How often the gatekeeper maintenance loop runs
    pub gatekeeper_interval: Duration,
    /// Lifetime of a storage contract for a newly distributed block
    pub contract_horizon: Duration,
    /// Upper bound on waiting for a peer's transport to become available
    pub peer_wait_timeout: Duration,
    /// Contract updates whose hour is further than this from local time are ignored
    pub max_clock_skew: Duration,
    /// Maximum number of plaintext shard bytes packed into one block
    pub max_block_bytes: usize,
    /// Maximum number of shards packed into one block
    pub max_shards_per_block: usize,
    /// Allowed inequality assigned to freshly contracted peers
    pub default_allowed_inequality: i64,
    /// Number of protocol tasks allowed to run at the same time
    pub worker_pool_size: usize,
    /// Number of contracted peers the gatekeeper tries to maintain
    pub contract_target: usize,
    /// Maximum number of simultaneous connections
    pub max_connections: usize,
    /// Whether the gatekeeper dials public peers learned through PEX
    pub public_peer_search: bool,
    /// Well-known bootstrap trackers
    pub trackers: Vec<SocketAddr>,
    /// Time after startup before trackers are considered
    pub bootstrap_grace: Duration,
    /// Time over which the expected peer count ramps up to the contract target
    pub bootstrap_ramp_up: Duration,
    /// Peers rated below this after their probation are de-contracted
    pub min_peer_rating: f64,
    /// Time after first contact before a peer's rating is acted on
    pub rating_probation: Duration,
    /// Capacity of the peer exchange address cache
    pub pex_cache_capacity: usize,
    /// Directory where contract and appraisal state is persisted, if any
    pub state_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        engine_config_file::EngineConfigFile::default().into()
    }
}
