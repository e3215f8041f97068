// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! On-disk form of the engine configuration

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{constants::*, error::ConfigError, EngineConfig};

/// Contains configuration values for `Reliquary`, with durations in seconds
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfigFile {
    /// Passphrase the symmetric block key is derived from
    pub shared_passphrase: String,
    /// Seconds between contract updates
    pub contract_update_interval_secs: u64,
    /// Seconds between uptime ticks
    pub uptime_tick_interval_secs: u64,
    /// Uptime gaps longer than this many seconds are not credited. Defaults to
    /// three uptime ticks.
    pub max_tick_gap_secs: Option<u64>,
    /// Seconds between gatekeeper runs
    pub gatekeeper_interval_secs: u64,
    /// Contract lifetime in seconds
    pub contract_horizon_secs: u64,
    /// Seconds to wait for a peer's transport
    pub peer_wait_timeout_secs: u64,
    /// Tolerated skew on contract update hours, in seconds
    pub max_clock_skew_secs: u64,
    /// Maximum plaintext bytes per block
    pub max_block_bytes: usize,
    /// Maximum shards per block
    pub max_shards_per_block: usize,
    /// Allowed inequality for freshly contracted peers
    pub default_allowed_inequality: i64,
    /// Size of the protocol worker pool
    pub worker_pool_size: usize,
    /// Contracted peers to maintain
    pub contract_target: usize,
    /// Maximum simultaneous connections
    pub max_connections: usize,
    /// Whether public PEX entries are dialled
    pub public_peer_search: bool,
    /// Bootstrap trackers
    pub trackers: Vec<SocketAddr>,
    /// Startup grace before dialling trackers, in seconds
    pub bootstrap_grace_secs: u64,
    /// Ramp-up period of the expected peer count, in seconds
    pub bootstrap_ramp_up_secs: u64,
    /// Minimum rating after probation
    pub min_peer_rating: f64,
    /// Rating probation in seconds
    pub rating_probation_secs: u64,
    /// Capacity of the PEX cache
    pub pex_cache_capacity: usize,
    /// State directory
    pub state_dir: Option<PathBuf>,
}

impl Default for EngineConfigFile {
    fn default() -> Self {
        Self {
            shared_passphrase: String::new(),
            contract_update_interval_secs: DEFAULT_CONTRACT_UPDATE_INTERVAL_SECS,
            uptime_tick_interval_secs: DEFAULT_UPTIME_TICK_INTERVAL_SECS,
            max_tick_gap_secs: None,
            gatekeeper_interval_secs: DEFAULT_GATEKEEPER_INTERVAL_SECS,
            contract_horizon_secs: DEFAULT_CONTRACT_HORIZON_SECS,
            peer_wait_timeout_secs: DEFAULT_PEER_WAIT_TIMEOUT_SECS,
            max_clock_skew_secs: DEFAULT_MAX_CLOCK_SKEW_SECS,
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
            max_shards_per_block: DEFAULT_MAX_SHARDS_PER_BLOCK,
            default_allowed_inequality: 0,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            contract_target: DEFAULT_CONTRACT_TARGET,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            public_peer_search: true,
            trackers: Vec::new(),
            bootstrap_grace_secs: DEFAULT_BOOTSTRAP_GRACE_SECS,
            bootstrap_ramp_up_secs: DEFAULT_BOOTSTRAP_RAMP_UP_SECS,
            min_peer_rating: DEFAULT_MIN_PEER_RATING,
            rating_probation_secs: DEFAULT_RATING_PROBATION_SECS,
            pex_cache_capacity: DEFAULT_PEX_CACHE_CAPACITY,
            state_dir: None,
        }
    }
}

impl EngineConfigFile {
    /// Parse a config file from its TOML representation
    ///
    /// # Errors
    /// If the text is not valid TOML for this structure
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a config file from disk
    ///
    /// # Errors
    /// If the file cannot be read or parsed
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}

impl From<EngineConfigFile> for EngineConfig {
    fn from(val: EngineConfigFile) -> Self {
        EngineConfig {
            shared_passphrase: val.shared_passphrase,
            contract_update_interval: Duration::from_secs(val.contract_update_interval_secs),
            uptime_tick_interval: Duration::from_secs(val.uptime_tick_interval_secs),
            max_tick_gap: Duration::from_secs(
                val.max_tick_gap_secs
                    .unwrap_or(val.uptime_tick_interval_secs.saturating_mul(3)),
            ),
            gatekeeper_interval: Duration::from_secs(val.gatekeeper_interval_secs),
            contract_horizon: Duration::from_secs(val.contract_horizon_secs),
            peer_wait_timeout: Duration::from_secs(val.peer_wait_timeout_secs),
            max_clock_skew: Duration::from_secs(val.max_clock_skew_secs),
            max_block_bytes: val.max_block_bytes,
            max_shards_per_block: val.max_shards_per_block.max(1),
            default_allowed_inequality: val.default_allowed_inequality,
            worker_pool_size: val.worker_pool_size.max(1),
            contract_target: val.contract_target,
            max_connections: val.max_connections,
            public_peer_search: val.public_peer_search,
            trackers: val.trackers,
            bootstrap_grace: Duration::from_secs(val.bootstrap_grace_secs),
            bootstrap_ramp_up: Duration::from_secs(val.bootstrap_ramp_up_secs),
            min_peer_rating: val.min_peer_rating.clamp(0.0, 1.0),
            rating_probation: Duration::from_secs(val.rating_probation_secs),
            pex_cache_capacity: val.pex_cache_capacity.max(1),
            state_dir: val.state_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let file = EngineConfigFile::from_toml(
            r#"
            shared_passphrase = "correct horse"
            contract_target = 3
            trackers = ["10.0.0.1:4100"]
            "#,
        )
        .unwrap();

        assert_eq!(file.contract_target, 3);
        assert_eq!(file.max_connections, DEFAULT_MAX_CONNECTIONS);

        let config: EngineConfig = file.into();
        assert_eq!(config.shared_passphrase, "correct horse");
        assert_eq!(config.trackers.len(), 1);
        assert_eq!(
            config.max_tick_gap,
            Duration::from_secs(DEFAULT_UPTIME_TICK_INTERVAL_SECS * 3)
        );
    }

    #[test]
    fn malformed_file_is_rejected() {
        assert!(EngineConfigFile::from_toml("contract_target = \"many\"").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "contract_update_interval_secs = 15\n").unwrap();

        let config: EngineConfig = EngineConfigFile::load(&path).unwrap().into();
        assert_eq!(config.contract_update_interval, Duration::from_secs(15));
    }
}
