// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_lock::RwLock;
use async_trait::async_trait;
use reliquary_types::{
    data::{ContentHash, JournalEntry, PeerCertificate, PeerId, ShardHash},
    error::{BackupError, StoreError},
    traits::{BackupLedger, CertificateStore, ContentStore},
    utils::BoundedOrderedMap,
};
use tracing::warn;

/// A capped content-addressed store kept in memory
#[derive(Clone, Debug)]
pub struct MemoryContentStore {
    /// Content by hash
    inner: Arc<RwLock<BTreeMap<ContentHash, Vec<u8>>>>,
    /// Cap in bytes
    capacity: u64,
}

impl MemoryContentStore {
    /// An empty store holding at most `capacity` bytes
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
            capacity,
        }
    }

    /// Flip a bit of stored content, simulating disk rot
    ///
    /// Returns whether the content was present.
    pub async fn corrupt(&self, hash: &ContentHash) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(hash).and_then(|bytes| bytes.first_mut()) {
            Some(byte) => {
                *byte ^= 0x01;
                true
            }
            None => false,
        }
    }

    /// Drop everything, simulating a lost disk
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    /// Number of stored items
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn store(&self, hash: ContentHash, bytes: Vec<u8>) -> Result<(), StoreError> {
        if !hash.matches(&bytes) {
            return Err(StoreError::HashMismatch(hash));
        }
        let mut inner = self.inner.write().await;
        if inner.contains_key(&hash) {
            return Ok(());
        }
        let used: u64 = inner.values().map(|bytes| bytes.len() as u64).sum();
        let available = self.capacity.saturating_sub(used);
        let needed = bytes.len() as u64;
        if needed > available {
            return Err(StoreError::StorageFull { needed, available });
        }
        inner.insert(hash, bytes);
        Ok(())
    }

    async fn retrieve(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(bytes) = inner.get(hash) else {
            return Err(StoreError::NotFound(*hash));
        };
        if hash.matches(bytes) {
            return Ok(bytes.clone());
        }
        warn!("Evicting corrupted content {hash}");
        inner.remove(hash);
        Err(StoreError::Corrupted(*hash))
    }

    async fn has(&self, hash: &ContentHash) -> bool {
        self.inner.read().await.contains_key(hash)
    }

    async fn remove(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.remove(hash).is_some())
    }

    async fn list(&self) -> Vec<ContentHash> {
        self.inner.read().await.keys().copied().collect()
    }

    async fn size(&self) -> u64 {
        self.inner
            .read()
            .await
            .values()
            .map(|bytes| bytes.len() as u64)
            .sum()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Internal state of a [`MemoryBackupLedger`]
#[derive(Debug, Default)]
struct MemoryBackupLedgerState {
    /// Shards pinned as required regardless of the journal
    pinned: BTreeSet<ShardHash>,
    /// The journal
    entries: BTreeSet<JournalEntry>,
    /// Every entry handed to [`BackupLedger::insert_journal_entry`], in order
    insertions: Vec<JournalEntry>,
}

/// A file-version journal kept in memory
///
/// Every shard referenced by a journal entry is required, plus any shard pinned explicitly.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackupLedger {
    /// The actual state
    inner: Arc<RwLock<MemoryBackupLedgerState>>,
}

impl MemoryBackupLedger {
    /// Record a file version
    pub async fn record(&self, entry: JournalEntry) {
        self.inner.write().await.entries.insert(entry);
    }

    /// Require shards that no journal entry references
    pub async fn pin(&self, shards: impl IntoIterator<Item = ShardHash> + Send) {
        self.inner.write().await.pinned.extend(shards);
    }

    /// Lose the journal but keep its shards required, simulating a rebuilt index
    pub async fn forget_entries(&self) {
        let mut inner = self.inner.write().await;
        let entries = std::mem::take(&mut inner.entries);
        for entry in entries {
            inner.pinned.extend(entry.shards);
        }
    }

    /// The journal
    pub async fn entries(&self) -> BTreeSet<JournalEntry> {
        self.inner.read().await.entries.clone()
    }

    /// Every entry re-inserted so far, duplicates included
    pub async fn insertions(&self) -> Vec<JournalEntry> {
        self.inner.read().await.insertions.clone()
    }
}

#[async_trait]
impl BackupLedger for MemoryBackupLedger {
    async fn all_required_shard_hashes(&self) -> Result<BTreeSet<ShardHash>, BackupError> {
        let inner = self.inner.read().await;
        let mut required = inner.pinned.clone();
        for entry in &inner.entries {
            required.extend(entry.shards.iter().copied());
        }
        Ok(required)
    }

    async fn related_journal_entries(
        &self,
        shard: &ShardHash,
    ) -> Result<Vec<JournalEntry>, BackupError> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .iter()
            .filter(|entry| entry.references(shard))
            .cloned()
            .collect())
    }

    async fn insert_journal_entry(&self, entry: JournalEntry) -> Result<(), BackupError> {
        let mut inner = self.inner.write().await;
        inner.insertions.push(entry.clone());
        inner.entries.insert(entry);
        Ok(())
    }
}

/// A bounded certificate store kept in memory
///
/// When full, the certificate persisted longest ago is dropped.
#[derive(Clone, Debug)]
pub struct MemoryCertificateStore {
    /// Certificates by peer
    inner: Arc<RwLock<BoundedOrderedMap<PeerId, PeerCertificate>>>,
}

impl MemoryCertificateStore {
    /// A store holding at most `capacity` certificates
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BoundedOrderedMap::new(capacity))),
        }
    }

    /// Number of stored certificates
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no certificate is stored
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn persist(&self, peer: PeerId, certificate: PeerCertificate) -> Result<(), StoreError> {
        if !certificate.verify(&peer) {
            return Err(StoreError::IdentityMismatch(peer));
        }
        self.inner.write().await.insert(peer, certificate);
        Ok(())
    }

    async fn get(&self, peer: &PeerId) -> Option<PeerCertificate> {
        self.inner.read().await.get(peer).cloned()
    }

    async fn prune(&self, keep: &BTreeSet<PeerId>) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|peer, _| keep.contains(peer));
        before.saturating_sub(inner.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn content_is_verified_and_capped() {
        let store = MemoryContentStore::new(8);
        let small = b"four".to_vec();
        let hash = ContentHash::of(&small);

        assert!(matches!(
            store.store(ContentHash::of(b"other"), small.clone()).await,
            Err(StoreError::HashMismatch(_))
        ));
        store.store(hash, small.clone()).await.unwrap();
        assert_eq!(store.retrieve(&hash).await.unwrap(), small);
        assert_eq!(store.size().await, 4);

        let big = b"too large".to_vec();
        assert!(matches!(
            store.store(ContentHash::of(&big), big).await,
            Err(StoreError::StorageFull {
                needed: 9,
                available: 4
            })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupted_content_is_evicted_on_read() {
        let store = MemoryContentStore::new(u64::MAX);
        let bytes = b"content".to_vec();
        let hash = ContentHash::of(&bytes);
        store.store(hash, bytes).await.unwrap();

        assert!(store.corrupt(&hash).await);
        assert!(matches!(
            store.retrieve(&hash).await,
            Err(StoreError::Corrupted(_))
        ));
        assert!(!store.has(&hash).await);
        assert!(matches!(
            store.retrieve(&hash).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forgotten_entries_stay_required() {
        let ledger = MemoryBackupLedger::default();
        let shard = ContentHash::of(b"shard");
        let entry = JournalEntry {
            path: "notes.txt".to_string(),
            version: 1,
            modified: Utc::now(),
            shards: vec![shard],
        };
        ledger.record(entry.clone()).await;
        assert_eq!(ledger.related_journal_entries(&shard).await.unwrap(), vec![entry]);

        ledger.forget_entries().await;
        assert!(ledger.related_journal_entries(&shard).await.unwrap().is_empty());
        assert_eq!(
            ledger.all_required_shard_hashes().await.unwrap(),
            [shard].into()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn certificates_must_match_and_are_pruned() {
        let store = MemoryCertificateStore::new(4);
        let cert = PeerCertificate::generated_from_seed_indexed([5; 32], 1);
        let other = PeerCertificate::generated_from_seed_indexed([5; 32], 2);

        assert!(store.persist(other.peer_id(), cert.clone()).await.is_err());
        store.persist(cert.peer_id(), cert.clone()).await.unwrap();
        store.persist(other.peer_id(), other.clone()).await.unwrap();

        assert_eq!(store.prune(&[cert.peer_id()].into()).await, 1);
        assert_eq!(store.get(&cert.peer_id()).await, Some(cert));
        assert!(store.get(&other.peer_id()).await.is_none());
    }
}
