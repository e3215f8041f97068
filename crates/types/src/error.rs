// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Error types for `Reliquary`
//!
//! This module provides the error enums raised by the block codec, the ledgers, the contract
//! manager and the collaborator stores. Transport errors live next to the transport trait in
//! [`crate::traits::network`].

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    data::{BlockId, ContentHash, PeerId},
    traits::network::TransportError,
};

/// Failure to pack or unpack a block
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlockError {
    /// A shard could not be compressed
    #[error("Failed to compress shard {0}")]
    Compression(ContentHash),

    /// A shard could not be decompressed
    #[error("Failed to decompress shard {0}")]
    Decompression(ContentHash),

    /// The container could not be encrypted
    #[error("Failed to encrypt block")]
    Encryption,

    /// The container could not be decrypted, it is corrupted or the key is wrong
    #[error("Failed to decrypt block")]
    Decryption,

    /// The ciphertext is too short to hold a nonce and a tag
    #[error("Ciphertext of {0} bytes is too short")]
    Truncated(usize),

    /// The container could not be (de)serialized
    #[error("Failed to (de)serialize block container: {0}")]
    Serialization(#[from] bincode::Error),

    /// A decoded shard does not hash to the hash recorded for it
    #[error("Shard {0} does not match its content")]
    ShardMismatch(ContentHash),

    /// A block must hold at least one shard
    #[error("Block holds no shards")]
    Empty,
}

/// Failure of a shard or block store
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Content is not in the store
    #[error("Content not found: {0}")]
    NotFound(ContentHash),

    /// Storing would exceed the storage cap
    #[error("Storage full: {needed} bytes needed, {available} available")]
    StorageFull {
        /// bytes the write needs
        needed: u64,
        /// bytes left under the cap
        available: u64,
    },

    /// Stored content no longer matches its hash; it has been evicted
    #[error("Content {0} is corrupted")]
    Corrupted(ContentHash),

    /// Content offered for storage does not match the hash it was offered under
    #[error("Content does not match hash {0}")]
    HashMismatch(ContentHash),

    /// A certificate offered for a peer identifies someone else
    #[error("Certificate does not identify peer {0}")]
    IdentityMismatch(PeerId),

    /// Backend failure
    #[error("Storage backend failure: {0}")]
    Backend(String),
}

/// Failure of the backup ledger collaborator
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackupError {
    /// The backup ledger could not be read or written
    #[error("Backup ledger unavailable: {0}")]
    Unavailable(String),
}

/// Failure to find an evidence challenge
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvidenceError {
    /// No challenge exists for the block at the requested hour
    #[error("No evidence for block {block_id} at {time}")]
    NotFound {
        /// the block
        block_id: BlockId,
        /// the requested time
        time: DateTime<Utc>,
    },
}

/// Failure to load a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure to save or load persisted engine state
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The state directory could not be read or written
    #[error("State I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// A state file could not be (de)serialized
    #[error("State (de)serialization failure: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Error type for the contract manager and its ledgers
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContractError {
    /// There is no contract with the peer
    #[error("No contract with peer {0}")]
    NoContract(PeerId),

    /// The block is not known
    #[error("Unknown block {0}")]
    UnknownBlock(BlockId),

    /// The block is already placed with another peer
    #[error("Block {block_id} is already held by {holder}")]
    AlreadyPlaced {
        /// the block
        block_id: BlockId,
        /// the peer already holding it
        holder: PeerId,
    },

    /// Data received from a peer failed verification
    #[error("Verification of block {block_id} from {peer} failed: {reason}")]
    Verification {
        /// the peer that sent the data
        peer: PeerId,
        /// the block concerned
        block_id: BlockId,
        /// what did not match
        reason: String,
    },

    /// Block codec failure
    #[error(transparent)]
    Block(#[from] BlockError),

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Backup ledger failure
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Evidence lookup failure
    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Persistence failure
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
