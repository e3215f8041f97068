// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! The local file-version journal, as seen by the engine

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::{
    data::{JournalEntry, ShardHash},
    error::BackupError,
};

/// Source of the shards that need off-site redundancy
#[async_trait]
pub trait BackupLedger: Send + Sync + 'static {
    /// Every shard referenced by a file version that must stay recoverable
    ///
    /// # Errors
    /// If the journal cannot be read
    async fn all_required_shard_hashes(&self) -> Result<BTreeSet<ShardHash>, BackupError>;

    /// Journal entries referencing a shard
    ///
    /// # Errors
    /// If the journal cannot be read
    async fn related_journal_entries(
        &self,
        shard: &ShardHash,
    ) -> Result<Vec<JournalEntry>, BackupError>;

    /// Re-insert a journal entry recovered from a peer
    ///
    /// # Errors
    /// If the journal cannot be written
    async fn insert_journal_entry(&self, entry: JournalEntry) -> Result<(), BackupError>;
}
