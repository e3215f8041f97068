// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Bookkeeping for blocks this node relies on peers to hold

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reliquary_types::data::{BlockId, PeerId, ShardHash};
use serde::{Deserialize, Serialize};

/// What a block placed with a peer contains, and until when the arrangement holds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The block
    pub block_id: BlockId,
    /// Shards packed into the block
    pub shard_hashes: BTreeSet<ShardHash>,
    /// Who owns the block
    pub owner: PeerId,
    /// Who stores the block
    pub holder: PeerId,
    /// When the contract for this block ends
    pub expiry: DateTime<Utc>,
}

/// Concurrent map from block id to [`LedgerEntry`]
#[derive(Debug, Default)]
pub struct BlockLedger {
    /// Entries by block
    entries: DashMap<BlockId, LedgerEntry>,
}

impl BlockLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a block, replacing and returning any previous entry for it
    pub fn add(
        &self,
        block_id: BlockId,
        shard_hashes: BTreeSet<ShardHash>,
        owner: PeerId,
        holder: PeerId,
        expiry: DateTime<Utc>,
    ) -> Option<LedgerEntry> {
        self.entries.insert(
            block_id,
            LedgerEntry {
                block_id,
                shard_hashes,
                owner,
                holder,
                expiry,
            },
        )
    }

    /// Look up a block
    #[must_use]
    pub fn get(&self, block_id: &BlockId) -> Option<LedgerEntry> {
        self.entries.get(block_id).map(|entry| entry.clone())
    }

    /// Forget a block
    pub fn remove(&self, block_id: &BlockId) -> Option<LedgerEntry> {
        self.entries.remove(block_id).map(|(_, entry)| entry)
    }

    /// Whether the block is recorded
    #[must_use]
    pub fn contains(&self, block_id: &BlockId) -> bool {
        self.entries.contains_key(block_id)
    }

    /// Every shard already packed into some recorded block
    #[must_use]
    pub fn assigned_shards(&self) -> BTreeSet<ShardHash> {
        self.entries
            .iter()
            .flat_map(|entry| entry.shard_hashes.clone())
            .collect()
    }

    /// Blocks recorded as held by `holder`
    #[must_use]
    pub fn blocks_held_by(&self, holder: &PeerId) -> BTreeSet<BlockId> {
        self.entries
            .iter()
            .filter(|entry| entry.holder == *holder)
            .map(|entry| entry.block_id)
            .collect()
    }

    /// Forget every block held by `holder`, returning the removed entries
    pub fn remove_holder(&self, holder: &PeerId) -> Vec<LedgerEntry> {
        self.blocks_held_by(holder)
            .iter()
            .filter_map(|block_id| self.remove(block_id))
            .collect()
    }

    /// Entries whose expiry is at or before `now`
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.expiry <= now)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Number of recorded blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no block is recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
