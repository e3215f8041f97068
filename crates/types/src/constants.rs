// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! configurable constants for reliquary

/// Number of hour buckets in a week
pub const HOURS_PER_WEEK: usize = 168;

/// Blocks adopted from a holder's report that may await verification at once
pub const MAX_UNVERIFIED_ADOPTIONS: usize = 64;

/// Length, in bytes, of the salt stored inside a block container
pub const BLOCK_SALT_LEN: usize = 16;

/// Length, in bytes, of an evidence challenge salt
pub const EVIDENCE_SALT_LEN: usize = 16;

/// zstd level used for shard compression. Low levels favour speed.
pub const SHARD_COMPRESSION_LEVEL: i32 = 1;

/// Default channel size for engine event sharing
pub const EVENT_CHANNEL_SIZE: usize = 10_000;

/// Default channel size for messages queued inside the in-memory transport
pub const TRANSPORT_CHANNEL_SIZE: usize = 1024;

/// the default interval between contract updates, in seconds
pub const DEFAULT_CONTRACT_UPDATE_INTERVAL_SECS: u64 = 600;

/// the default interval between uptime ticks, in seconds
pub const DEFAULT_UPTIME_TICK_INTERVAL_SECS: u64 = 60;

/// the default interval between gatekeeper runs, in seconds
pub const DEFAULT_GATEKEEPER_INTERVAL_SECS: u64 = 30;

/// the default contract horizon, in seconds (30 days)
pub const DEFAULT_CONTRACT_HORIZON_SECS: u64 = 30 * 24 * 3600;

/// the default bound on waiting for a peer's transport, in seconds
pub const DEFAULT_PEER_WAIT_TIMEOUT_SECS: u64 = 5;

/// the default tolerated clock skew on contract updates, in seconds
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: u64 = 3600;

/// the default maximum plaintext bytes per block (8 MiB)
pub const DEFAULT_MAX_BLOCK_BYTES: usize = 8 * 1024 * 1024;

/// the default maximum number of shards per block
pub const DEFAULT_MAX_SHARDS_PER_BLOCK: usize = 64;

/// the default size of the protocol worker pool
pub const DEFAULT_WORKER_POOL_SIZE: usize = 32;

/// the default number of contracted peers to maintain
pub const DEFAULT_CONTRACT_TARGET: usize = 8;

/// the default maximum number of connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 24;

/// the default startup grace period before trackers are dialled, in seconds
pub const DEFAULT_BOOTSTRAP_GRACE_SECS: u64 = 120;

/// the default ramp-up period for the expected peer count, in seconds
pub const DEFAULT_BOOTSTRAP_RAMP_UP_SECS: u64 = 1800;

/// the default minimum peer rating before de-contracting
pub const DEFAULT_MIN_PEER_RATING: f64 = 0.25;

/// the default rating probation, in seconds (7 days)
pub const DEFAULT_RATING_PROBATION_SECS: u64 = 7 * 24 * 3600;

/// the default capacity of the peer exchange cache
pub const DEFAULT_PEX_CACHE_CAPACITY: usize = 512;

/// name of the appraisal snapshot inside the state directory
pub const APPRAISAL_STATE_FILE: &str = "appraisals.bin";

/// name of the contract sub-directory inside the state directory
pub const CONTRACT_STATE_DIR: &str = "contracts";
