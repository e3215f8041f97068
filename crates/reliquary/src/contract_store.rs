// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Per-peer contract bookkeeping
//!
//! For every contracted peer the store keeps two disjoint sets of block ids: `mine`, the blocks
//! this node owns and the peer holds, and `theirs`, the blocks the peer owns and this node holds.
//! A placement index guarantees that a block of mine is held by at most one peer.
//!
//! Lock order: a placement entry may be held while a peer entry is taken, never the reverse.

use std::{collections::BTreeSet, path::Path};

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use reliquary_types::{
    data::{BlockId, PeerId},
    error::{ContractError, PersistenceError},
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

/// File extension of persisted peer contracts
const CONTRACT_FILE_EXTENSION: &str = "bin";

/// The contract with a single peer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerContract {
    /// Blocks I own that the peer holds
    pub mine: BTreeSet<BlockId>,
    /// Blocks the peer owns that I hold
    pub theirs: BTreeSet<BlockId>,
    /// How many blocks above the fleet average I accept from the peer
    pub allowed_inequality: i64,
    /// How many blocks above the fleet average the peer last said it accepts from me
    pub granted_inequality: Option<i64>,
}

/// Outcome of [`ContractStore::try_add_contracted_peer`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The peer was newly contracted
    Added,
    /// The peer already had a contract
    AlreadyContracted,
    /// The target was reached, the peer was not contracted
    Full,
}

impl Admission {
    /// Whether the peer holds a contract after the attempt
    #[must_use]
    pub fn is_contracted(self) -> bool {
        self != Admission::Full
    }
}

/// A contract as written to disk
#[derive(Serialize, Deserialize)]
struct PersistedContract {
    /// The peer
    peer: PeerId,
    /// The contract
    contract: PeerContract,
}

/// Concurrent store of every [`PeerContract`]
#[derive(Debug)]
pub struct ContractStore {
    /// Contracts by peer
    peers: DashMap<PeerId, PeerContract>,
    /// Holder of each block in some `mine` set
    placements: DashMap<BlockId, PeerId>,
    /// Allowed inequality given to new contracts
    default_allowed_inequality: i64,
    /// Held while a peer is admitted, so the count check and the insert cannot interleave
    admission: Mutex<()>,
}

impl ContractStore {
    /// Create an empty store
    #[must_use]
    pub fn new(default_allowed_inequality: i64) -> Self {
        Self {
            peers: DashMap::new(),
            placements: DashMap::new(),
            default_allowed_inequality,
            admission: Mutex::new(()),
        }
    }

    /// Contract a peer. Contracting an already contracted peer changes nothing.
    ///
    /// Returns whether the peer was newly contracted.
    pub fn add_contracted_peer(&self, peer: PeerId) -> bool {
        let _admission = self.admission.lock();
        self.insert_contract(peer)
    }

    /// Contract a peer unless `target` peers are already contracted
    ///
    /// An already contracted peer is kept whatever the count.
    pub fn try_add_contracted_peer(&self, peer: PeerId, target: usize) -> Admission {
        let _admission = self.admission.lock();
        if self.peers.contains_key(&peer) {
            Admission::AlreadyContracted
        } else if self.peers.len() >= target {
            Admission::Full
        } else if self.insert_contract(peer) {
            Admission::Added
        } else {
            Admission::AlreadyContracted
        }
    }

    /// Insert an empty contract. Caller holds the admission lock.
    fn insert_contract(&self, peer: PeerId) -> bool {
        match self.peers.entry(peer) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(PeerContract {
                    allowed_inequality: self.default_allowed_inequality,
                    ..PeerContract::default()
                });
                true
            }
        }
    }

    /// Drop the contract with a peer, returning it
    pub fn remove_contracted_peer(&self, peer: &PeerId) -> Option<PeerContract> {
        let (_, contract) = self.peers.remove(peer)?;
        for block_id in &contract.mine {
            self.placements
                .remove_if(block_id, |_, holder| holder == peer);
        }
        Some(contract)
    }

    /// Whether a contract with the peer exists
    #[must_use]
    pub fn is_contracted(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// All contracted peers
    #[must_use]
    pub fn contracted_peers(&self) -> BTreeSet<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of contracted peers
    #[must_use]
    pub fn contracted_count(&self) -> usize {
        self.peers.len()
    }

    /// A copy of the contract with a peer
    #[must_use]
    pub fn contract(&self, peer: &PeerId) -> Option<PeerContract> {
        self.peers.get(peer).map(|contract| contract.clone())
    }

    /// Set how many blocks above the average I accept from the peer
    ///
    /// # Errors
    /// [`ContractError::NoContract`] if the peer is not contracted
    pub fn set_allowed_inequality(&self, peer: &PeerId, n: i64) -> Result<(), ContractError> {
        let mut contract = self
            .peers
            .get_mut(peer)
            .ok_or(ContractError::NoContract(*peer))?;
        contract.allowed_inequality = n;
        Ok(())
    }

    /// Record how many blocks above the average the peer accepts from me
    ///
    /// # Errors
    /// [`ContractError::NoContract`] if the peer is not contracted
    pub fn set_granted_inequality(&self, peer: &PeerId, n: i64) -> Result<(), ContractError> {
        let mut contract = self
            .peers
            .get_mut(peer)
            .ok_or(ContractError::NoContract(*peer))?;
        contract.granted_inequality = Some(n);
        Ok(())
    }

    /// The allowed inequality for a peer
    #[must_use]
    pub fn allowed_inequality(&self, peer: &PeerId) -> Option<i64> {
        self.peers.get(peer).map(|contract| contract.allowed_inequality)
    }

    /// Record that the peer holds a block of mine
    ///
    /// Returns whether the block was newly added.
    ///
    /// # Errors
    /// [`ContractError::NoContract`] if the peer is not contracted, or
    /// [`ContractError::AlreadyPlaced`] if another peer already holds the block
    pub fn add_my_block_id(&self, peer: &PeerId, block_id: BlockId) -> Result<bool, ContractError> {
        match self.placements.entry(block_id) {
            Entry::Occupied(occupied) if occupied.get() != peer => {
                Err(ContractError::AlreadyPlaced {
                    block_id,
                    holder: *occupied.get(),
                })
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                let mut contract = self
                    .peers
                    .get_mut(peer)
                    .ok_or(ContractError::NoContract(*peer))?;
                contract.mine.insert(block_id);
                vacant.insert(*peer);
                Ok(true)
            }
        }
    }

    /// Forget that the peer holds a block of mine, returning whether it did
    pub fn remove_my_block_id(&self, peer: &PeerId, block_id: &BlockId) -> bool {
        let removed = self
            .peers
            .get_mut(peer)
            .is_some_and(|mut contract| contract.mine.remove(block_id));
        self.placements
            .remove_if(block_id, |_, holder| holder == peer);
        removed
    }

    /// Record that I hold a block for the peer
    ///
    /// Returns whether the block was newly added.
    ///
    /// # Errors
    /// [`ContractError::NoContract`] if the peer is not contracted
    pub fn add_peer_block_id(
        &self,
        peer: &PeerId,
        block_id: BlockId,
    ) -> Result<bool, ContractError> {
        let mut contract = self
            .peers
            .get_mut(peer)
            .ok_or(ContractError::NoContract(*peer))?;
        Ok(contract.theirs.insert(block_id))
    }

    /// Forget that I hold a block for the peer, returning whether I did
    pub fn remove_peer_block_id(&self, peer: &PeerId, block_id: &BlockId) -> bool {
        self.peers
            .get_mut(peer)
            .is_some_and(|mut contract| contract.theirs.remove(block_id))
    }

    /// Blocks of mine held by `peer`, or by anyone when `peer` is `None`
    #[must_use]
    pub fn get_my_block_ids(&self, peer: Option<&PeerId>) -> BTreeSet<BlockId> {
        match peer {
            Some(peer) => self
                .peers
                .get(peer)
                .map(|contract| contract.mine.clone())
                .unwrap_or_default(),
            None => self
                .peers
                .iter()
                .flat_map(|contract| contract.mine.clone())
                .collect(),
        }
    }

    /// Blocks I hold for `peer`
    #[must_use]
    pub fn get_peer_block_ids(&self, peer: &PeerId) -> BTreeSet<BlockId> {
        self.peers
            .get(peer)
            .map(|contract| contract.theirs.clone())
            .unwrap_or_default()
    }

    /// Whether I hold `block_id` for `peer`
    #[must_use]
    pub fn holds_for(&self, peer: &PeerId, block_id: &BlockId) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|contract| contract.theirs.contains(block_id))
    }

    /// The peer holding a block of mine
    #[must_use]
    pub fn holder_of(&self, block_id: &BlockId) -> Option<PeerId> {
        self.placements.get(block_id).map(|holder| *holder)
    }

    /// Whether the peer may take another block of mine
    ///
    /// A peer is under quota while it holds no more than the floored fleet average plus the
    /// smaller of the inequality I allow it and the inequality it granted me.
    #[must_use]
    pub fn is_under_quota(&self, peer: &PeerId) -> bool {
        let (mut total, mut count) = (0i64, 0i64);
        let mut this = None;
        for entry in &self.peers {
            let held = i64::try_from(entry.mine.len()).unwrap_or(i64::MAX);
            total = total.saturating_add(held);
            count += 1;
            if entry.key() == peer {
                let inequality = entry
                    .granted_inequality
                    .map_or(entry.allowed_inequality, |granted| {
                        granted.min(entry.allowed_inequality)
                    });
                this = Some((held, inequality));
            }
        }
        let Some((held, inequality)) = this else {
            return false;
        };
        held <= (total / count).saturating_add(inequality)
    }

    /// Write one file per contracted peer into `dir`, removing files of peers no longer contracted
    ///
    /// # Errors
    /// If the directory cannot be written or a contract cannot be serialized
    pub async fn persist_to(&self, dir: &Path) -> Result<(), PersistenceError> {
        fs::create_dir_all(dir).await?;
        let snapshot: Vec<PersistedContract> = self
            .peers
            .iter()
            .map(|entry| PersistedContract {
                peer: *entry.key(),
                contract: entry.value().clone(),
            })
            .collect();

        let mut written = BTreeSet::new();
        for persisted in &snapshot {
            let path = dir
                .join(persisted.peer.to_hex())
                .with_extension(CONTRACT_FILE_EXTENSION);
            fs::write(&path, bincode::serialize(persisted)?).await?;
            written.insert(path);
        }

        let mut stale = fs::read_dir(dir).await?;
        while let Some(file) = stale.next_entry().await? {
            let path = file.path();
            let is_contract =
                path.extension().and_then(|ext| ext.to_str()) == Some(CONTRACT_FILE_EXTENSION);
            if is_contract && !written.contains(&path) {
                fs::remove_file(&path).await?;
            }
        }
        debug!("Persisted {} contracts to {}", snapshot.len(), dir.display());
        Ok(())
    }

    /// Load every persisted contract from `dir`, returning how many were loaded
    ///
    /// A missing directory loads nothing. Unreadable files are skipped.
    ///
    /// # Errors
    /// If the directory exists but cannot be listed
    pub async fn load_from(&self, dir: &Path) -> Result<usize, PersistenceError> {
        let mut files = match fs::read_dir(dir).await {
            Ok(files) => files,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CONTRACT_FILE_EXTENSION) {
                continue;
            }
            let persisted = match fs::read(&path)
                .await
                .map_err(PersistenceError::from)
                .and_then(|bytes| {
                    bincode::deserialize::<PersistedContract>(&bytes).map_err(Into::into)
                }) {
                Ok(persisted) => persisted,
                Err(e) => {
                    warn!("Skipping unreadable contract file {}: {e}", path.display());
                    continue;
                }
            };
            for block_id in &persisted.contract.mine {
                self.placements.insert(*block_id, persisted.peer);
            }
            self.peers.insert(persisted.peer, persisted.contract);
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use reliquary_types::data::ContentHash;

    use super::*;

    fn peer(index: u64) -> PeerId {
        PeerId::generated_from_seed_indexed([3; 32], index)
    }

    #[test]
    fn contracting_is_idempotent() {
        let store = ContractStore::new(2);
        assert!(store.add_contracted_peer(peer(1)));
        store.add_my_block_id(&peer(1), ContentHash::of(b"b")).unwrap();
        assert!(!store.add_contracted_peer(peer(1)));

        assert_eq!(store.contracted_count(), 1);
        assert_eq!(store.get_my_block_ids(Some(&peer(1))).len(), 1);
        assert_eq!(store.allowed_inequality(&peer(1)), Some(2));
    }

    #[test]
    fn a_block_is_placed_with_one_peer_only() {
        let store = ContractStore::new(0);
        store.add_contracted_peer(peer(1));
        store.add_contracted_peer(peer(2));
        let block = ContentHash::of(b"block");

        assert!(store.add_my_block_id(&peer(1), block).unwrap());
        assert!(!store.add_my_block_id(&peer(1), block).unwrap());
        assert!(matches!(
            store.add_my_block_id(&peer(2), block),
            Err(ContractError::AlreadyPlaced { holder, .. }) if holder == peer(1)
        ));

        assert!(store.remove_my_block_id(&peer(1), &block));
        assert!(store.add_my_block_id(&peer(2), block).unwrap());
        assert_eq!(store.holder_of(&block), Some(peer(2)));
    }

    #[test]
    fn unknown_peers_are_rejected() {
        let store = ContractStore::new(0);
        let block = ContentHash::of(b"block");
        assert!(matches!(
            store.add_peer_block_id(&peer(9), block),
            Err(ContractError::NoContract(_))
        ));
        assert!(matches!(
            store.add_my_block_id(&peer(9), block),
            Err(ContractError::NoContract(_))
        ));
        assert_eq!(store.holder_of(&block), None);
    }

    #[test]
    fn decontracting_frees_placements() {
        let store = ContractStore::new(0);
        store.add_contracted_peer(peer(1));
        store.add_contracted_peer(peer(2));
        let block = ContentHash::of(b"block");
        store.add_my_block_id(&peer(1), block).unwrap();
        store.add_peer_block_id(&peer(1), ContentHash::of(b"theirs")).unwrap();

        let contract = store.remove_contracted_peer(&peer(1)).unwrap();
        assert_eq!(contract.theirs.len(), 1);
        assert!(!store.is_contracted(&peer(1)));
        assert!(store.add_my_block_id(&peer(2), block).unwrap());
    }

    #[test]
    fn quota_follows_fleet_average_and_granted_inequality() {
        let store = ContractStore::new(1);
        store.add_contracted_peer(peer(1));
        store.add_contracted_peer(peer(2));
        for i in 0..4u8 {
            store.add_my_block_id(&peer(1), ContentHash::of(&[i])).unwrap();
        }
        // average 2, peer 1 holds 4
        assert!(!store.is_under_quota(&peer(1)));
        assert!(store.is_under_quota(&peer(2)));

        store.set_allowed_inequality(&peer(1), 2).unwrap();
        assert!(store.is_under_quota(&peer(1)));

        // the peer only accepts one above average from me
        store.set_granted_inequality(&peer(1), 1).unwrap();
        assert!(!store.is_under_quota(&peer(1)));
        assert!(!store.is_under_quota(&peer(3)));
    }

    #[test]
    fn concurrent_placements_never_double_place() {
        let store = Arc::new(ContractStore::new(0));
        for i in 0..4 {
            store.add_contracted_peer(peer(i));
        }
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..200u32)
                        .filter(|b| {
                            store
                                .add_my_block_id(&peer(i), ContentHash::of(&b.to_le_bytes()))
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();
        let placed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(placed, 200);
        assert_eq!(store.get_my_block_ids(None).len(), 200);
    }

    #[test]
    fn admission_stops_at_the_target() {
        let store = ContractStore::new(0);
        assert_eq!(store.try_add_contracted_peer(peer(1), 1), Admission::Added);
        assert_eq!(store.try_add_contracted_peer(peer(2), 1), Admission::Full);
        assert_eq!(
            store.try_add_contracted_peer(peer(1), 0),
            Admission::AlreadyContracted
        );
        assert!(!Admission::Full.is_contracted());
        assert_eq!(store.contracted_peers(), [peer(1)].into());
    }

    #[test]
    fn concurrent_admissions_never_exceed_the_target() {
        let store = Arc::new(ContractStore::new(0));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.try_add_contracted_peer(peer(i), 4))
            })
            .collect();
        let added = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admission| *admission == Admission::Added)
            .count();

        assert_eq!(added, 4);
        assert_eq!(store.contracted_count(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn contracts_survive_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContractStore::new(0);
        store.add_contracted_peer(peer(1));
        store.add_contracted_peer(peer(2));
        let block = ContentHash::of(b"block");
        store.add_my_block_id(&peer(1), block).unwrap();
        store.set_granted_inequality(&peer(1), 5).unwrap();
        store.persist_to(dir.path()).await.unwrap();

        store.remove_contracted_peer(&peer(2));
        store.persist_to(dir.path()).await.unwrap();

        let restored = ContractStore::new(0);
        assert_eq!(restored.load_from(dir.path()).await.unwrap(), 1);
        assert_eq!(restored.contract(&peer(1)), store.contract(&peer(1)));
        assert_eq!(restored.holder_of(&block), Some(peer(1)));
        assert!(!restored.is_contracted(&peer(2)));

        let missing = dir.path().join("missing");
        assert_eq!(restored.load_from(&missing).await.unwrap(), 0);
    }
}
