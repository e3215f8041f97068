// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Abstract storage type for content-addressed shards and blocks
//!
//! The same interface serves two stores: the shard store holding this node's own shards and the
//! block store holding blocks kept on behalf of peers.

use async_trait::async_trait;

use crate::{data::ContentHash, error::StoreError};

/// A content-addressed store with a storage cap
///
/// Implementations must verify content against its hash on every read; content that no longer
/// matches is evicted and reported as [`StoreError::Corrupted`].
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Store content under its hash
    ///
    /// # Errors
    /// If the content does not hash to `hash` or the cap would be exceeded
    async fn store(&self, hash: ContentHash, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Read content back, verifying it
    ///
    /// # Errors
    /// If the content is missing or corrupted
    async fn retrieve(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError>;

    /// Whether content is present, without verifying it
    async fn has(&self, hash: &ContentHash) -> bool;

    /// Remove content, returning whether it was present
    ///
    /// # Errors
    /// If the backend fails
    async fn remove(&self, hash: &ContentHash) -> Result<bool, StoreError>;

    /// All stored hashes
    async fn list(&self) -> Vec<ContentHash>;

    /// Bytes currently stored
    async fn size(&self) -> u64;

    /// The storage cap in bytes
    fn capacity(&self) -> u64;
}
