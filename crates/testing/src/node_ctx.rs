// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

use std::{net::SocketAddr, sync::Arc};

use reliquary::{block_codec::SharedKey, Collaborators, ContractManager, Engine};
use reliquary_example_types::{
    network_types::{MasterMap, MemoryNetwork},
    node_types::MemoryImpl,
    storage_types::{MemoryBackupLedger, MemoryCertificateStore, MemoryContentStore},
};
use reliquary_task::worker_pool::WorkerPool;
use reliquary_types::{
    data::{JournalEntry, PeerCertificate, PeerId, ShardHash},
    error::{PersistenceError, StoreError},
    traits::{ContentStore, Transport},
    EngineConfig,
};

use crate::helpers::{journal_entry, shard};

/// Seed every test identity is derived from
pub const TEST_SEED: [u8; 32] = [7; 32];

/// One node of a test group and its in-memory collaborators
#[derive(Clone, Debug)]
pub struct TestNode {
    /// Position in the group
    pub index: u64,
    /// The node's identity
    pub certificate: PeerCertificate,
    /// Its transport
    pub network: Arc<MemoryNetwork>,
    /// Its own shards
    pub shard_store: Arc<MemoryContentStore>,
    /// Blocks it holds for others
    pub block_store: Arc<MemoryContentStore>,
    /// Its file-version journal
    pub backup: Arc<MemoryBackupLedger>,
    /// Certificates of its contracted peers
    pub certificates: Arc<MemoryCertificateStore>,
}

impl TestNode {
    /// Attach node `index` to a group
    #[must_use]
    pub fn new(index: u64, master_map: &Arc<MasterMap>) -> Self {
        let certificate = PeerCertificate::generated_from_seed_indexed(TEST_SEED, index);
        let network = MemoryNetwork::new(certificate.clone(), Some(address(index)), master_map);
        Self {
            index,
            certificate,
            network,
            shard_store: Arc::new(MemoryContentStore::new(u64::MAX)),
            block_store: Arc::new(MemoryContentStore::new(u64::MAX)),
            backup: Arc::new(MemoryBackupLedger::default()),
            certificates: Arc::new(MemoryCertificateStore::new(64)),
        }
    }

    /// The node's id
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.certificate.peer_id()
    }

    /// Where the node can be dialled
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        address(self.index)
    }

    /// Handles on every collaborator
    #[must_use]
    pub fn collaborators(&self) -> Collaborators<MemoryImpl> {
        Collaborators {
            transport: Arc::clone(&self.network),
            shard_store: Arc::clone(&self.shard_store),
            block_store: Arc::clone(&self.block_store),
            backup: Arc::clone(&self.backup),
            certificates: Arc::clone(&self.certificates),
        }
    }

    /// A contract manager for this node, outside of any engine
    #[must_use]
    pub fn manager(&self, config: &EngineConfig) -> ContractManager<MemoryImpl> {
        ContractManager::new(
            self.id(),
            config,
            SharedKey::from_passphrase(&config.shared_passphrase),
            self.collaborators(),
            WorkerPool::new(config.worker_pool_size),
        )
    }

    /// An engine for this node, not yet started
    ///
    /// # Errors
    /// If persisted state cannot be read
    pub async fn engine(&self, config: EngineConfig) -> Result<Engine<MemoryImpl>, PersistenceError> {
        Engine::init(self.id(), config, self.collaborators()).await
    }

    /// Store a one-shard file version locally and record it in the journal
    ///
    /// # Errors
    /// If the shard cannot be stored
    pub async fn back_up(
        &self,
        path: &str,
        content: &[u8],
    ) -> Result<(ShardHash, JournalEntry), StoreError> {
        let (hash, bytes) = shard(content);
        self.shard_store.store(hash, bytes).await?;
        let entry = journal_entry(path, 1, &[hash]);
        self.backup.record(entry.clone()).await;
        Ok((hash, entry))
    }

    /// Dial another node
    ///
    /// # Errors
    /// If the other node is not reachable
    pub async fn connect(
        &self,
        other: &TestNode,
    ) -> Result<PeerId, reliquary_types::traits::TransportError> {
        self.network.connect(other.address()).await
    }
}

/// The listening address of node `index`
fn address(index: u64) -> SocketAddr {
    let port = 20_000 + u16::try_from(index % 10_000).unwrap_or(0);
    SocketAddr::from(([127, 0, 0, 1], port))
}
