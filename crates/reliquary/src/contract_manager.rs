// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! The storage contract protocol
//!
//! The [`ContractManager`] places blocks of local shards with contracted peers, turns the
//! peers' periodic contract updates into evidence requests, answers evidence requests for blocks
//! it holds for others, and applies evidence responses to the ledgers.
//!
//! Each `(peer, block)` pair moves through the same states. A block is placed and uploaded. The
//! first time the holder reports it, the owner asks for the full block (`SEND_BLOCK`) and, once
//! it verifies, precomputes the evidence chain. From then on every report is answered with a
//! salted hash challenge (`COMPUTE_HASH`). A block missing from two reports in different hours,
//! left unproven across two later hours, failing verification, expiring, or no longer needed is
//! dropped with `DELETE_BLOCK`.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use async_lock::Mutex;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use reliquary_task::worker_pool::WorkerPool;
use reliquary_types::{
    constants::MAX_UNVERIFIED_ADOPTIONS,
    data::{BlockId, ContentHash, JournalEntry, PeerId, ShardHash},
    error::{ContractError, StoreError},
    message::{
        BlockUpload, EvidenceKind, EvidencePayload, EvidenceRequest, EvidenceResponse,
        PeerMessage,
    },
    temporal::{floor_hour, to_time_delta},
    traits::{BackupLedger, ContentStore, NodeImplementation, Transport, TransportError},
    EngineConfig,
};
use tokio::{task::spawn_blocking, time::timeout};
use tracing::{debug, info, instrument, warn};

use crate::{
    appraisal_ledger::AppraisalLedger,
    block_codec::{Block, SharedKey},
    block_ledger::BlockLedger,
    contract_store::{Admission, ContractStore},
    evidence_ledger::{salted_digest, EvidenceChain, EvidenceLedger},
};

/// Handles to the collaborators a node is built from
pub struct Collaborators<I: NodeImplementation> {
    /// Peer transport
    pub transport: Arc<I::Transport>,
    /// This node's shards
    pub shard_store: Arc<I::ShardStore>,
    /// Blocks held for peers
    pub block_store: Arc<I::BlockStore>,
    /// Local file-version journal
    pub backup: Arc<I::BackupLedger>,
    /// Peer certificates
    pub certificates: Arc<I::CertificateStore>,
}

impl<I: NodeImplementation> Clone for Collaborators<I> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            shard_store: Arc::clone(&self.shard_store),
            block_store: Arc::clone(&self.block_store),
            backup: Arc::clone(&self.backup),
            certificates: Arc::clone(&self.certificates),
        }
    }
}

/// A request sent to a holder and not answered yet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Outstanding {
    /// What was asked for
    kind: EvidenceKind,
    /// The hour the request was issued in
    hour: DateTime<Utc>,
}

/// Result of verifying one evidence response
enum Verdict {
    /// The holder proved it has the block
    Confirmed,
    /// The block verified but nothing in it is needed any more
    Unneeded,
}

/// What processing a batch of evidence responses did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvidenceSummary {
    /// Blocks the responder proved to hold
    pub confirmed: BTreeSet<BlockId>,
    /// Blocks the responder failed to prove
    pub failed: BTreeSet<BlockId>,
    /// Shards restored into the local shard store
    pub recovered_shards: BTreeSet<ShardHash>,
    /// Journal entries restored into the backup ledger
    pub recovered_entries: BTreeSet<JournalEntry>,
    /// Responses nobody asked for
    pub ignored: usize,
}

/// Inner state of a [`ContractManager`]
struct ContractManagerInner<I: NodeImplementation> {
    /// This node
    my_id: PeerId,
    /// Key every block is sealed with
    key: SharedKey,
    /// Lifetime of a contract for a new block
    contract_horizon: TimeDelta,
    /// Maximum plaintext bytes per block
    max_block_bytes: usize,
    /// Maximum shards per block
    max_shards_per_block: usize,
    /// Contract updates further than this from local time are ignored
    max_clock_skew: TimeDelta,
    /// How long an upload may wait for its peer
    peer_wait_timeout: Duration,
    /// Collaborators
    collaborators: Collaborators<I>,
    /// Per-peer block sets
    contracts: ContractStore,
    /// Blocks I rely on peers to hold
    blocks: BlockLedger,
    /// Challenge chains for blocks I rely on peers to hold
    evidence: EvidenceLedger,
    /// Peer reliability
    appraisals: AppraisalLedger,
    /// First missed report of a block, by holder and block
    strikes: DashMap<(PeerId, BlockId), DateTime<Utc>>,
    /// Blocks to delete from a holder at its next contract update
    pending_deletion: DashMap<PeerId, BTreeSet<BlockId>>,
    /// Requests awaiting a response, by holder and block
    outstanding: DashMap<(PeerId, BlockId), Outstanding>,
    /// Blocks adopted from a holder's report and not verified yet
    adopted: DashMap<PeerId, BTreeSet<BlockId>>,
    /// Serializes the protocol steps taken for one peer
    sessions: DashMap<PeerId, Arc<Mutex<()>>>,
    /// Runs uploads
    pool: WorkerPool,
}

/// Drives the storage contract protocol with every contracted peer
pub struct ContractManager<I: NodeImplementation> {
    /// Shared state
    inner: Arc<ContractManagerInner<I>>,
}

impl<I: NodeImplementation> Clone for ContractManager<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: NodeImplementation> ContractManager<I> {
    /// Create a manager with empty ledgers
    #[must_use]
    pub fn new(
        my_id: PeerId,
        config: &EngineConfig,
        key: SharedKey,
        collaborators: Collaborators<I>,
        pool: WorkerPool,
    ) -> Self {
        let inner = ContractManagerInner {
            my_id,
            key,
            contract_horizon: to_time_delta(config.contract_horizon),
            max_block_bytes: config.max_block_bytes,
            max_shards_per_block: config.max_shards_per_block.max(1),
            max_clock_skew: to_time_delta(config.max_clock_skew),
            peer_wait_timeout: config.peer_wait_timeout,
            collaborators,
            contracts: ContractStore::new(config.default_allowed_inequality),
            blocks: BlockLedger::new(),
            evidence: EvidenceLedger::new(),
            appraisals: AppraisalLedger::new(config.max_tick_gap),
            strikes: DashMap::new(),
            pending_deletion: DashMap::new(),
            outstanding: DashMap::new(),
            adopted: DashMap::new(),
            sessions: DashMap::new(),
            pool,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// This node
    #[must_use]
    pub fn my_id(&self) -> PeerId {
        self.inner.my_id
    }

    /// Per-peer block sets
    #[must_use]
    pub fn contracts(&self) -> &ContractStore {
        &self.inner.contracts
    }

    /// Blocks I rely on peers to hold
    #[must_use]
    pub fn blocks(&self) -> &BlockLedger {
        &self.inner.blocks
    }

    /// Challenge chains
    #[must_use]
    pub fn evidence(&self) -> &EvidenceLedger {
        &self.inner.evidence
    }

    /// Peer reliability
    #[must_use]
    pub fn appraisals(&self) -> &AppraisalLedger {
        &self.inner.appraisals
    }

    /// The collaborators
    #[must_use]
    pub fn collaborators(&self) -> &Collaborators<I> {
        &self.inner.collaborators
    }

    /// Hour of the first missed report of a block, if it has one
    #[must_use]
    pub fn strike(&self, holder: &PeerId, block_id: &BlockId) -> Option<DateTime<Utc>> {
        self.inner
            .strikes
            .get(&(*holder, *block_id))
            .map(|hour| *hour)
    }

    /// Blocks waiting to be deleted from a holder
    #[must_use]
    pub fn pending_deletions(&self, holder: &PeerId) -> BTreeSet<BlockId> {
        self.inner
            .pending_deletion
            .get(holder)
            .map(|blocks| blocks.clone())
            .unwrap_or_default()
    }

    /// Wait for every queued upload to finish
    pub async fn drain(&self) {
        self.inner.pool.drain().await;
    }

    /// The lock serializing protocol steps for a peer
    fn session(&self, peer: &PeerId) -> Arc<Mutex<()>> {
        Arc::clone(&self.inner.sessions.entry(*peer).or_default())
    }

    /// Fail unless the peer is contracted
    fn ensure_contracted(&self, peer: &PeerId) -> Result<(), ContractError> {
        if self.inner.contracts.is_contracted(peer) {
            Ok(())
        } else {
            Err(ContractError::NoContract(*peer))
        }
    }

    /// Contract a peer. Contracting an already contracted peer changes nothing.
    pub fn add_contracted_peer(&self, peer: PeerId) -> bool {
        let added = self.inner.contracts.add_contracted_peer(peer);
        if added {
            info!("Contracted peer {peer}");
        }
        added
    }

    /// Contract a peer unless `target` peers are already contracted
    pub fn try_add_contracted_peer(&self, peer: PeerId, target: usize) -> Admission {
        let admission = self.inner.contracts.try_add_contracted_peer(peer, target);
        if admission == Admission::Added {
            info!("Contracted peer {peer}");
        }
        admission
    }

    /// Forget a block of mine placed with `holder`
    fn drop_local(&self, holder: &PeerId, block_id: &BlockId) {
        let inner = &self.inner;
        inner.contracts.remove_my_block_id(holder, block_id);
        inner.blocks.remove(block_id);
        inner.evidence.remove(block_id);
        inner.strikes.remove(&(*holder, *block_id));
        inner.outstanding.remove(&(*holder, *block_id));
        self.settle_adoption(holder, block_id);
    }

    /// Stop counting a block against the holder's adoption limit
    fn settle_adoption(&self, holder: &PeerId, block_id: &BlockId) {
        if let Some(mut adopted) = self.inner.adopted.get_mut(holder) {
            adopted.remove(block_id);
        }
    }

    /// Adopted blocks from `holder` still waiting for their `SEND_BLOCK` answer
    #[must_use]
    pub fn unverified_adoptions(&self, holder: &PeerId) -> usize {
        self.inner
            .adopted
            .get(holder)
            .map_or(0, |adopted| adopted.len())
    }

    /// Delete a block from `holder` at its next contract update
    fn schedule_deletion(&self, holder: &PeerId, block_id: BlockId) {
        self.inner
            .pending_deletion
            .entry(*holder)
            .or_default()
            .insert(block_id);
    }

    /// Turn a holder's contract update into evidence requests
    ///
    /// # Errors
    /// [`ContractError::NoContract`] if the sender is not contracted
    #[instrument(skip_all, fields(peer = %sender, reported = reported.len()))]
    pub async fn process_peer_contract_update(
        &self,
        sender: &PeerId,
        time: DateTime<Utc>,
        offset: i64,
        reported: &BTreeSet<BlockId>,
    ) -> Result<BTreeSet<EvidenceRequest>, ContractError> {
        self.ensure_contracted(sender)?;
        let session = self.session(sender);
        let _guard = session.lock().await;
        let inner = &self.inner;

        inner.contracts.set_granted_inequality(sender, offset)?;
        let hour = floor_hour(time);
        let mut requests = BTreeSet::new();
        let mut deleted = BTreeSet::new();

        if let Some((_, pending)) = inner.pending_deletion.remove(sender) {
            for block_id in pending {
                self.drop_local(sender, &block_id);
                requests.insert(EvidenceRequest::delete_block(block_id));
                deleted.insert(block_id);
            }
        }

        let mine = inner.contracts.get_my_block_ids(Some(sender));
        for block_id in &mine {
            let key = (*sender, *block_id);

            if inner
                .blocks
                .get(block_id)
                .is_some_and(|entry| entry.expiry <= time)
            {
                debug!("Contract for block {block_id} expired");
                inner.appraisals.register_completed_contract(*sender, time);
                self.drop_local(sender, block_id);
                requests.insert(EvidenceRequest::delete_block(*block_id));
                deleted.insert(*block_id);
                continue;
            }

            if !reported.contains(block_id) {
                let struck_earlier = inner.strikes.get(&key).map(|first| *first < hour);
                match struck_earlier {
                    Some(true) => {
                        info!("Block {block_id} missing from two reports, deleting it");
                        self.drop_local(sender, block_id);
                        requests.insert(EvidenceRequest::delete_block(*block_id));
                        deleted.insert(*block_id);
                    }
                    Some(false) => {}
                    None => {
                        debug!("Block {block_id} missing from report, first strike");
                        inner.strikes.insert(key, hour);
                    }
                }
                continue;
            }

            // a request from an earlier hour still unanswered counts as a missed report
            let asked = inner.outstanding.get(&key).map(|outstanding| outstanding.hour);
            match asked {
                None => {
                    inner.strikes.remove(&key);
                }
                Some(asked) if asked < hour => {
                    let struck_earlier = inner.strikes.get(&key).map(|first| *first < hour);
                    match struck_earlier {
                        Some(true) => {
                            warn!("Block {block_id} reported but never proven, deleting it");
                            inner
                                .appraisals
                                .register_lost_block(*sender, time, mine.len());
                            self.drop_local(sender, block_id);
                            requests.insert(EvidenceRequest::delete_block(*block_id));
                            deleted.insert(*block_id);
                            continue;
                        }
                        Some(false) => {}
                        None => {
                            debug!("Request for block {block_id} unanswered, first strike");
                            inner.strikes.insert(key, hour);
                        }
                    }
                }
                Some(_) => {}
            }

            let request = if inner.evidence.contains(block_id) {
                match inner.evidence.get_salt(block_id, time) {
                    Ok(salt) => EvidenceRequest::compute_hash(*block_id, salt),
                    Err(e) => {
                        debug!("{e}, asking for the block again");
                        inner.evidence.remove(block_id);
                        EvidenceRequest::send_block(*block_id)
                    }
                }
            } else {
                EvidenceRequest::send_block(*block_id)
            };
            inner.outstanding.insert(
                key,
                Outstanding {
                    kind: request.kind,
                    hour,
                },
            );
            requests.insert(request);
        }

        let mut room =
            MAX_UNVERIFIED_ADOPTIONS.saturating_sub(self.unverified_adoptions(sender));
        for block_id in reported.difference(&mine) {
            if deleted.contains(block_id) || inner.contracts.holder_of(block_id).is_some() {
                continue;
            }
            if room == 0 {
                debug!("Adoption limit reached, leaving the rest for later updates");
                break;
            }
            if inner.contracts.add_my_block_id(sender, *block_id)? {
                debug!("Adopting unknown block {block_id}");
                inner.adopted.entry(*sender).or_default().insert(*block_id);
                room -= 1;
                inner.outstanding.insert(
                    (*sender, *block_id),
                    Outstanding {
                        kind: EvidenceKind::SendBlock,
                        hour,
                    },
                );
                requests.insert(EvidenceRequest::send_block(*block_id));
            }
        }

        Ok(requests)
    }

    /// Answer evidence requests for blocks I hold for the requester
    ///
    /// `DELETE_BLOCK` requests are carried out and produce no response.
    ///
    /// # Errors
    /// [`ContractError::NoContract`] if the requester is not contracted
    #[instrument(skip_all, fields(peer = %requester, %time))]
    pub async fn process_evidence_requests(
        &self,
        requester: &PeerId,
        time: DateTime<Utc>,
        requests: &BTreeSet<EvidenceRequest>,
    ) -> Result<BTreeSet<EvidenceResponse>, ContractError> {
        self.ensure_contracted(requester)?;
        let session = self.session(requester);
        let _guard = session.lock().await;
        let inner = &self.inner;
        let block_store = &inner.collaborators.block_store;

        let mut responses = BTreeSet::new();
        for request in requests {
            let block_id = request.block_id;
            if !inner.contracts.holds_for(requester, &block_id) {
                debug!("Not holding block {block_id} for the requester");
                continue;
            }

            if request.kind == EvidenceKind::DeleteBlock {
                if let Err(e) = block_store.remove(&block_id).await {
                    warn!("Failed to delete block {block_id}: {e}");
                }
                inner.contracts.remove_peer_block_id(requester, &block_id);
                continue;
            }

            let bytes = match block_store.retrieve(&block_id).await {
                Ok(bytes) => bytes,
                Err(e @ (StoreError::NotFound(_) | StoreError::Corrupted(_))) => {
                    warn!("Lost block {block_id}: {e}");
                    inner.contracts.remove_peer_block_id(requester, &block_id);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read block {block_id}: {e}");
                    continue;
                }
            };
            let payload = match request.kind {
                EvidenceKind::ComputeHash => {
                    EvidencePayload::Digest(salted_digest(&request.salt, &bytes))
                }
                _ => EvidencePayload::Block(bytes),
            };
            responses.insert(EvidenceResponse { block_id, payload });
        }
        Ok(responses)
    }

    /// Apply a holder's evidence responses
    ///
    /// Failed proofs penalize the responder and schedule the block for deletion; they are not
    /// returned as errors.
    ///
    /// # Errors
    /// [`ContractError::NoContract`] if the responder is not contracted
    #[instrument(skip_all, fields(peer = %responder, %time))]
    pub async fn process_evidence_responses(
        &self,
        responder: &PeerId,
        time: DateTime<Utc>,
        responses: BTreeSet<EvidenceResponse>,
    ) -> Result<EvidenceSummary, ContractError> {
        self.ensure_contracted(responder)?;
        let session = self.session(responder);
        let _guard = session.lock().await;
        let inner = &self.inner;

        let expected = inner.contracts.get_my_block_ids(Some(responder)).len();
        let mut summary = EvidenceSummary::default();
        for response in responses {
            let block_id = response.block_id;
            let kind = response.kind();
            let Some((_, outstanding)) = inner
                .outstanding
                .remove_if(&(*responder, block_id), |_, outstanding| {
                    outstanding.kind == kind
                })
            else {
                debug!("Ignoring unsolicited {kind:?} response for block {block_id}");
                summary.ignored += 1;
                continue;
            };

            let verdict = match response.payload {
                EvidencePayload::Block(bytes) => {
                    self.recover_block(responder, block_id, time, bytes, &mut summary)
                        .await
                }
                EvidencePayload::Digest(digest) => {
                    self.verify_digest(responder, block_id, outstanding.hour, &digest)
                }
            };

            match verdict {
                Ok(Verdict::Confirmed) => {
                    inner.strikes.remove(&(*responder, block_id));
                    self.settle_adoption(responder, &block_id);
                    inner
                        .appraisals
                        .register_contact(*responder, time, expected, Some(block_id));
                    summary.confirmed.insert(block_id);
                }
                Ok(Verdict::Unneeded) => {
                    debug!("Block {block_id} holds nothing required, deleting it");
                    self.schedule_deletion(responder, block_id);
                }
                Err(e @ (ContractError::Verification { .. } | ContractError::Block(_))) => {
                    warn!("Evidence for block {block_id} failed: {e}");
                    inner
                        .appraisals
                        .register_lost_block(*responder, time, expected);
                    inner.evidence.remove(&block_id);
                    self.schedule_deletion(responder, block_id);
                    summary.failed.insert(block_id);
                }
                Err(e) => {
                    warn!("Could not apply evidence for block {block_id}, retrying next cycle: {e}");
                }
            }
        }
        Ok(summary)
    }

    /// Check a salted digest against the challenge of the hour it was issued in
    fn verify_digest(
        &self,
        responder: &PeerId,
        block_id: BlockId,
        hour: DateTime<Utc>,
        digest: &str,
    ) -> Result<Verdict, ContractError> {
        if self.inner.evidence.confirm(&block_id, hour, digest)? {
            Ok(Verdict::Confirmed)
        } else {
            Err(ContractError::Verification {
                peer: *responder,
                block_id,
                reason: "salted digest mismatch".to_string(),
            })
        }
    }

    /// Verify a full block from its holder, restore what is missing locally, and start its
    /// evidence chain
    async fn recover_block(
        &self,
        responder: &PeerId,
        block_id: BlockId,
        time: DateTime<Utc>,
        bytes: Vec<u8>,
        summary: &mut EvidenceSummary,
    ) -> Result<Verdict, ContractError> {
        let inner = &self.inner;
        let Collaborators {
            shard_store,
            backup,
            ..
        } = &inner.collaborators;

        if !block_id.matches(&bytes) {
            return Err(ContractError::Verification {
                peer: *responder,
                block_id,
                reason: "bytes do not hash to the block id".to_string(),
            });
        }
        let opened = Block::open(&bytes, &inner.key)?;

        let required = backup.all_required_shard_hashes().await?;
        let needed: BTreeSet<ShardHash> = opened
            .shards
            .keys()
            .filter(|hash| required.contains(hash))
            .copied()
            .collect();
        if needed.is_empty() {
            return Ok(Verdict::Unneeded);
        }

        for hash in &needed {
            if shard_store.has(hash).await {
                continue;
            }
            let Some(content) = opened.shards.get(hash) else {
                continue;
            };
            shard_store.store(*hash, content.clone()).await?;
            summary.recovered_shards.insert(*hash);

            let known = backup.related_journal_entries(hash).await?;
            for entry in opened.file_history.iter().filter(|entry| entry.references(hash)) {
                if known.contains(entry) || summary.recovered_entries.contains(entry) {
                    continue;
                }
                backup.insert_journal_entry(entry.clone()).await?;
                summary.recovered_entries.insert(entry.clone());
            }
        }

        let expiry = if let Some(entry) = inner.blocks.get(&block_id) {
            entry.expiry
        } else {
            let expiry = time + inner.contract_horizon;
            inner.blocks.add(
                block_id,
                opened.shards.keys().copied().collect(),
                inner.my_id,
                *responder,
                expiry,
            );
            expiry
        };
        match spawn_blocking(move || EvidenceChain::precompute(&bytes, time, expiry)).await {
            Ok(chain) => inner.evidence.insert(block_id, chain),
            Err(e) => warn!(
                "Evidence chain for block {block_id} not built, asking again next update: {e}"
            ),
        }
        Ok(Verdict::Confirmed)
    }

    /// Accept a block a peer wants me to hold
    ///
    /// # Errors
    /// [`ContractError::NoContract`] if the sender is not contracted,
    /// [`ContractError::Verification`] if the bytes do not match the id, or a store failure
    #[instrument(skip_all, fields(peer = %sender, block = %upload.block_id))]
    pub async fn receive_block(
        &self,
        sender: &PeerId,
        upload: BlockUpload,
    ) -> Result<(), ContractError> {
        self.ensure_contracted(sender)?;
        let BlockUpload {
            block_id,
            block_bytes,
        } = upload;
        if !block_id.matches(&block_bytes) {
            return Err(ContractError::Verification {
                peer: *sender,
                block_id,
                reason: "upload does not hash to its block id".to_string(),
            });
        }
        self.inner
            .collaborators
            .block_store
            .store(block_id, block_bytes)
            .await?;
        self.inner.contracts.add_peer_block_id(sender, block_id)?;
        debug!("Holding block {block_id}");
        Ok(())
    }

    /// The best rated connected, contracted peer still under quota
    fn pick_holder(&self, connected: &BTreeSet<PeerId>) -> Option<PeerId> {
        let inner = &self.inner;
        inner
            .contracts
            .contracted_peers()
            .into_iter()
            .filter(|peer| connected.contains(peer) && inner.contracts.is_under_quota(peer))
            .map(|peer| (inner.appraisals.get_peer_rating(&peer, None), peer))
            .max_by(|(a, a_peer), (b, b_peer)| a.total_cmp(b).then_with(|| b_peer.cmp(a_peer)))
            .map(|(_, peer)| peer)
    }

    /// Pack required local shards that no block covers yet and place them with peers
    ///
    /// Returns the number of blocks placed. Uploads run on the worker pool.
    ///
    /// # Errors
    /// If the backup ledger cannot be read or a block cannot be built
    #[instrument(skip_all, fields(%now))]
    pub async fn distribute(&self, now: DateTime<Utc>) -> Result<usize, ContractError> {
        let inner = &self.inner;
        let Collaborators {
            transport,
            shard_store,
            backup,
            ..
        } = &inner.collaborators;

        let assigned = inner.blocks.assigned_shards();
        let unassigned: Vec<ShardHash> = backup
            .all_required_shard_hashes()
            .await?
            .difference(&assigned)
            .copied()
            .collect();
        if unassigned.is_empty() {
            return Ok(0);
        }

        let mut groups = Vec::new();
        let mut group = BTreeMap::new();
        let mut group_bytes = 0usize;
        for hash in unassigned {
            if !shard_store.has(&hash).await {
                continue;
            }
            let content = match shard_store.retrieve(&hash).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Cannot distribute shard {hash}: {e}");
                    continue;
                }
            };
            if !group.is_empty()
                && (group_bytes + content.len() > inner.max_block_bytes
                    || group.len() >= inner.max_shards_per_block)
            {
                groups.push(std::mem::take(&mut group));
                group_bytes = 0;
            }
            group_bytes += content.len();
            group.insert(hash, content);
        }
        if !group.is_empty() {
            groups.push(group);
        }

        let connected = transport.connected_peers().await;
        let mut placed = 0;
        for group in groups {
            let Some(holder) = self.pick_holder(&connected) else {
                info!("No contracted peer can take more blocks");
                break;
            };

            let mut history = BTreeSet::new();
            for hash in group.keys() {
                history.extend(backup.related_journal_entries(hash).await?);
            }
            let block = Block::build(&group, history.into_iter().collect())?;
            let block_bytes = block.to_bytes(&inner.key)?;
            let block_id = ContentHash::of(&block_bytes);

            inner.contracts.add_my_block_id(&holder, block_id)?;
            inner.blocks.add(
                block_id,
                block.shard_hashes(),
                inner.my_id,
                holder,
                now + inner.contract_horizon,
            );
            debug!("Placing block {block_id} of {} shards with {holder}", group.len());

            let transport = Arc::clone(transport);
            let wait = inner.peer_wait_timeout;
            inner.pool.spawn(async move {
                let upload = transport.upload_block(&holder, block_id, block_bytes);
                let result = match timeout(wait, upload).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::PeerUnavailable { peer: holder }),
                };
                if let Err(e) = result {
                    warn!("Upload of block {block_id} to {holder} failed: {e}");
                }
            });
            placed += 1;
        }
        Ok(placed)
    }

    /// Tell every contracted, connected peer what I hold for it
    ///
    /// Returns the number of updates sent. A failed send does not stop the others.
    pub async fn send_contract_updates(&self, now: DateTime<Utc>) -> usize {
        let inner = &self.inner;
        let transport = &inner.collaborators.transport;
        let hour = floor_hour(now);

        let sends = inner.contracts.contracted_peers().into_iter().map(|peer| async move {
            if !transport.peer_connected(&peer).await {
                return false;
            }
            let Some(contract) = inner.contracts.contract(&peer) else {
                return false;
            };
            match transport
                .send_contract_update(&peer, hour, contract.allowed_inequality, contract.theirs)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!("Contract update to {peer} failed: {e}");
                    false
                }
            }
        });
        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    /// Drop a peer and everything tied to it, including the blocks I hold for it
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn remove_contracted_peer(&self, peer: &PeerId) {
        let session = self.session(peer);
        let _guard = session.lock().await;
        let inner = &self.inner;

        let Some(contract) = inner.contracts.remove_contracted_peer(peer) else {
            return;
        };
        for block_id in &contract.mine {
            inner.blocks.remove(block_id);
            inner.evidence.remove(block_id);
        }
        inner.blocks.remove_holder(peer);
        inner.strikes.retain(|(holder, _), _| holder != peer);
        inner.outstanding.retain(|(holder, _), _| holder != peer);
        inner.adopted.remove(peer);
        inner.pending_deletion.remove(peer);
        inner.appraisals.remove_peer(peer);
        for block_id in &contract.theirs {
            if let Err(e) = inner.collaborators.block_store.remove(block_id).await {
                warn!("Failed to delete block {block_id}: {e}");
            }
        }
        info!(
            "De-contracted peer, dropped {} placed and {} held blocks",
            contract.mine.len(),
            contract.theirs.len()
        );
    }

    /// Expire contracts and prune state no longer backed by a contract
    ///
    /// Returns the number of expired contracts.
    pub fn collect_garbage(&self, now: DateTime<Utc>) -> usize {
        let inner = &self.inner;
        let expired = inner.blocks.expired(now);
        for entry in &expired {
            inner.blocks.remove(&entry.block_id);
            inner
                .appraisals
                .register_completed_contract(entry.holder, now);
            self.schedule_deletion(&entry.holder, entry.block_id);
        }

        let live: BTreeSet<BlockId> = inner
            .contracts
            .get_my_block_ids(None)
            .into_iter()
            .filter(|block_id| inner.blocks.contains(block_id))
            .collect();
        let pruned = inner.evidence.remove_all_except(&live);

        let contracted = inner.contracts.contracted_peers();
        inner
            .strikes
            .retain(|(holder, _), _| contracted.contains(holder));
        inner
            .outstanding
            .retain(|(holder, _), _| contracted.contains(holder));
        inner
            .pending_deletion
            .retain(|holder, _| contracted.contains(holder));
        inner.adopted.retain(|holder, _| contracted.contains(holder));
        inner
            .sessions
            .retain(|peer, session| contracted.contains(peer) || Arc::strong_count(session) > 1);

        if !expired.is_empty() || pruned > 0 {
            debug!(
                "Expired {} contracts, pruned {pruned} evidence chains",
                expired.len()
            );
        }
        expired.len()
    }

    /// One contract cycle: collect garbage, distribute, send contract updates
    pub async fn run_cycle(&self, now: DateTime<Utc>) {
        self.collect_garbage(now);
        if let Err(e) = self.distribute(now).await {
            warn!("Distribution failed: {e}");
        }
        self.send_contract_updates(now).await;
    }

    /// Apply a protocol message from a peer at local time `now`
    ///
    /// # Errors
    /// If the sender is not contracted, the message fails verification, or a reply cannot be
    /// sent
    pub async fn handle_message(
        &self,
        sender: &PeerId,
        message: PeerMessage,
        now: DateTime<Utc>,
    ) -> Result<(), ContractError> {
        let transport = &self.inner.collaborators.transport;
        match message {
            PeerMessage::ContractUpdate(update) => {
                let skew = (update.hour_time - floor_hour(now)).abs();
                if skew > self.inner.max_clock_skew {
                    warn!(
                        "Ignoring contract update from {sender}, clock off by {}s",
                        skew.num_seconds()
                    );
                    return Ok(());
                }
                let requests = self
                    .process_peer_contract_update(
                        sender,
                        now,
                        update.allowed_inequality,
                        &update.stored_block_ids,
                    )
                    .await?;
                if !requests.is_empty() {
                    transport
                        .send_message(sender, PeerMessage::EvidenceRequests(requests))
                        .await?;
                }
            }
            PeerMessage::EvidenceRequests(requests) => {
                let responses = self
                    .process_evidence_requests(sender, now, &requests)
                    .await?;
                if !responses.is_empty() {
                    transport
                        .send_message(sender, PeerMessage::EvidenceResponses(responses))
                        .await?;
                }
            }
            PeerMessage::EvidenceResponses(responses) => {
                self.process_evidence_responses(sender, now, responses)
                    .await?;
            }
            PeerMessage::BlockUpload(upload) => self.receive_block(sender, upload).await?,
            other => debug!("Contract manager ignores {}", other.purpose()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use reliquary_example_types::{
        node_types::MemoryImpl,
        storage_types::{MemoryBackupLedger, MemoryCertificateStore, MemoryContentStore},
    };

    use super::*;

    fn peer(index: u64) -> PeerId {
        PeerId::generated_from_seed_indexed([9; 32], index)
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 5, hour, minute, 0).unwrap()
    }

    /// A manager whose transport is never used
    fn manager() -> ContractManager<MemoryImpl> {
        let me = peer(0);
        let collaborators = Collaborators::<MemoryImpl> {
            transport: reliquary_example_types::network_types::MemoryNetwork::isolated(me),
            shard_store: Arc::new(MemoryContentStore::new(u64::MAX)),
            block_store: Arc::new(MemoryContentStore::new(u64::MAX)),
            backup: Arc::new(MemoryBackupLedger::default()),
            certificates: Arc::new(MemoryCertificateStore::new(8)),
        };
        ContractManager::new(
            me,
            &EngineConfig::default(),
            SharedKey::from_passphrase("test"),
            collaborators,
            WorkerPool::new(2),
        )
    }

    fn kinds(requests: &BTreeSet<EvidenceRequest>) -> Vec<EvidenceKind> {
        requests.iter().map(|request| request.kind).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn updates_from_strangers_are_rejected() {
        let manager = manager();
        let result = manager
            .process_peer_contract_update(&peer(1), at(1, 0), 0, &BTreeSet::new())
            .await;
        assert!(matches!(result, Err(ContractError::NoContract(p)) if p == peer(1)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_reported_blocks_are_adopted_once() {
        let manager = manager();
        manager.add_contracted_peer(peer(1));
        manager.add_contracted_peer(peer(2));
        let block = ContentHash::of(b"block");
        let placed_elsewhere = ContentHash::of(b"elsewhere");
        manager
            .contracts()
            .add_my_block_id(&peer(2), placed_elsewhere)
            .unwrap();

        let reported: BTreeSet<_> = [block, placed_elsewhere].into();
        let requests = manager
            .process_peer_contract_update(&peer(1), at(1, 0), 3, &reported)
            .await
            .unwrap();
        assert_eq!(requests, [EvidenceRequest::send_block(block)].into());
        assert_eq!(manager.contracts().holder_of(&block), Some(peer(1)));
        assert_eq!(
            manager.contracts().contract(&peer(1)).unwrap().granted_inequality,
            Some(3)
        );

        let again = manager
            .process_peer_contract_update(&peer(1), at(1, 10), 3, &reported)
            .await
            .unwrap();
        assert_eq!(kinds(&again), vec![EvidenceKind::SendBlock]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unproven_adoptions_are_capped_penalized_and_dropped() {
        let manager = manager();
        manager.add_contracted_peer(peer(1));
        let reported: BTreeSet<BlockId> = (0..1000u32)
            .map(|i| ContentHash::of(&i.to_le_bytes()))
            .collect();

        let first = manager
            .process_peer_contract_update(&peer(1), at(10, 0), 0, &reported)
            .await
            .unwrap();
        assert_eq!(first.len(), MAX_UNVERIFIED_ADOPTIONS);
        let adopted = manager.contracts().get_my_block_ids(Some(&peer(1)));
        assert_eq!(adopted.len(), MAX_UNVERIFIED_ADOPTIONS);
        assert_eq!(manager.unverified_adoptions(&peer(1)), MAX_UNVERIFIED_ADOPTIONS);

        // nothing new is adopted while the first batch is unproven
        manager
            .process_peer_contract_update(&peer(1), at(10, 30), 0, &reported)
            .await
            .unwrap();
        assert_eq!(manager.contracts().get_my_block_ids(Some(&peer(1))), adopted);

        // requests from an earlier hour still unanswered count as a first strike
        let retried = manager
            .process_peer_contract_update(&peer(1), at(11, 0), 0, &reported)
            .await
            .unwrap();
        assert_eq!(
            kinds(&retried),
            vec![EvidenceKind::SendBlock; MAX_UNVERIFIED_ADOPTIONS]
        );
        assert!(adopted
            .iter()
            .all(|block| manager.strike(&peer(1), block) == Some(at(11, 0))));

        let requests = manager
            .process_peer_contract_update(&peer(1), at(12, 0), 0, &reported)
            .await
            .unwrap();
        let deleted: BTreeSet<BlockId> = requests
            .iter()
            .filter(|request| request.kind == EvidenceKind::DeleteBlock)
            .map(|request| request.block_id)
            .collect();
        assert_eq!(deleted, adopted);
        assert!(adopted
            .iter()
            .all(|block| manager.contracts().holder_of(block).is_none()));
        assert_eq!(
            manager
                .appraisals()
                .appraisal(&peer(1))
                .unwrap()
                .broken_contract_count,
            u64::try_from(MAX_UNVERIFIED_ADOPTIONS).unwrap()
        );
        assert!(
            manager.contracts().get_my_block_ids(Some(&peer(1))).len()
                <= MAX_UNVERIFIED_ADOPTIONS
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsolicited_responses_are_ignored() {
        let manager = manager();
        manager.add_contracted_peer(peer(1));
        let responses = [EvidenceResponse {
            block_id: ContentHash::of(b"block"),
            payload: EvidencePayload::Digest("00".to_string()),
        }]
        .into();
        let summary = manager
            .process_evidence_responses(&peer(1), at(1, 0), responses)
            .await
            .unwrap();
        assert_eq!(summary.ignored, 1);
        assert!(manager.appraisals().appraisal(&peer(1)).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_contracts_are_deleted_and_credited() {
        let manager = manager();
        manager.add_contracted_peer(peer(1));
        let block = ContentHash::of(b"block");
        manager.contracts().add_my_block_id(&peer(1), block).unwrap();
        manager
            .blocks()
            .add(block, BTreeSet::new(), peer(0), peer(1), at(2, 0));

        let requests = manager
            .process_peer_contract_update(&peer(1), at(3, 0), 0, &[block].into())
            .await
            .unwrap();
        assert_eq!(requests, [EvidenceRequest::delete_block(block)].into());
        assert!(manager.contracts().get_my_block_ids(None).is_empty());
        assert_eq!(
            manager
                .appraisals()
                .appraisal(&peer(1))
                .unwrap()
                .completed_contract_count,
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn garbage_collection_schedules_expired_blocks_for_deletion() {
        let manager = manager();
        manager.add_contracted_peer(peer(1));
        let block = ContentHash::of(b"block");
        manager.contracts().add_my_block_id(&peer(1), block).unwrap();
        manager
            .blocks()
            .add(block, BTreeSet::new(), peer(0), peer(1), at(2, 0));
        manager.evidence().add_contract_at(b"block", at(1, 0), at(2, 0));

        assert_eq!(manager.collect_garbage(at(2, 30)), 1);
        assert_eq!(manager.pending_deletions(&peer(1)), [block].into());
        assert!(manager.evidence().is_empty());

        let requests = manager
            .process_peer_contract_update(&peer(1), at(3, 0), 0, &[block].into())
            .await
            .unwrap();
        assert_eq!(requests, [EvidenceRequest::delete_block(block)].into());
        assert!(manager.pending_deletions(&peer(1)).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn holder_only_answers_for_blocks_it_holds_for_the_requester() {
        let manager = manager();
        manager.add_contracted_peer(peer(1));
        manager.add_contracted_peer(peer(2));
        let bytes = b"sealed block".to_vec();
        let block = ContentHash::of(&bytes);
        manager
            .receive_block(
                &peer(1),
                BlockUpload {
                    block_id: block,
                    block_bytes: bytes.clone(),
                },
            )
            .await
            .unwrap();

        let salt = vec![1, 2, 3];
        let requests = [EvidenceRequest::compute_hash(block, salt.clone())].into();
        let responses = manager
            .process_evidence_requests(&peer(1), at(1, 0), &requests)
            .await
            .unwrap();
        assert_eq!(
            responses,
            [EvidenceResponse {
                block_id: block,
                payload: EvidencePayload::Digest(salted_digest(&salt, &bytes)),
            }]
            .into()
        );

        let stranger = manager
            .process_evidence_requests(&peer(2), at(1, 0), &requests)
            .await
            .unwrap();
        assert!(stranger.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forged_uploads_are_rejected() {
        let manager = manager();
        manager.add_contracted_peer(peer(1));
        let result = manager
            .receive_block(
                &peer(1),
                BlockUpload {
                    block_id: ContentHash::of(b"claimed"),
                    block_bytes: b"actual".to_vec(),
                },
            )
            .await;
        assert!(matches!(result, Err(ContractError::Verification { .. })));
        assert!(manager.contracts().get_peer_block_ids(&peer(1)).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decontracting_purges_everything() {
        let manager = manager();
        manager.add_contracted_peer(peer(1));
        let mine = ContentHash::of(b"mine");
        manager.contracts().add_my_block_id(&peer(1), mine).unwrap();
        manager
            .blocks()
            .add(mine, BTreeSet::new(), peer(0), peer(1), at(9, 0));
        manager.evidence().add_contract_at(b"mine", at(1, 0), at(9, 0));
        manager
            .process_peer_contract_update(&peer(1), at(1, 0), 0, &BTreeSet::new())
            .await
            .unwrap();
        assert!(manager.strike(&peer(1), &mine).is_some());

        let theirs = b"theirs".to_vec();
        let theirs_id = ContentHash::of(&theirs);
        manager
            .receive_block(
                &peer(1),
                BlockUpload {
                    block_id: theirs_id,
                    block_bytes: theirs,
                },
            )
            .await
            .unwrap();

        manager
            .appraisals()
            .register_contact(peer(1), at(1, 5), 1, Some(mine));
        assert!(manager.appraisals().appraisal(&peer(1)).is_some());

        manager.remove_contracted_peer(&peer(1)).await;

        assert!(!manager.contracts().is_contracted(&peer(1)));
        assert!(manager.appraisals().appraisal(&peer(1)).is_none());
        assert!(manager.blocks().is_empty());
        assert!(manager.evidence().is_empty());
        assert!(manager.strike(&peer(1), &mine).is_none());
        assert!(!manager.collaborators().block_store.has(&theirs_id).await);
    }
}
