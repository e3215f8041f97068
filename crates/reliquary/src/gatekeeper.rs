// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Peer population maintenance
//!
//! The [`Gatekeeper`] keeps the number of contracted peers at the configured target. It reconnects
//! to contracted peers, learns addresses through peer exchange, makes room by dropping
//! non-contracted connections, falls back to bootstrap trackers when too few peers turn up, and
//! drops contracted peers whose rating stays too low.

use std::{collections::BTreeSet, net::SocketAddr, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use reliquary_types::{
    data::{PeerCertificate, PeerId, PexEntry},
    error::StoreError,
    message::PeerMessage,
    temporal::to_time_delta,
    traits::{CertificateStore, NodeImplementation, Transport},
    utils::BoundedOrderedMap,
    EngineConfig,
};
use tracing::{debug, info, instrument, warn};

use crate::contract_manager::ContractManager;

/// What one maintenance pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatekeeperReport {
    /// Contracted peers reconnected
    pub reconnected: usize,
    /// Public peers dialled
    pub dialed: usize,
    /// Connections closed to make room
    pub disconnected: usize,
    /// Trackers dialled
    pub trackers_dialed: usize,
    /// Peers de-contracted for a low rating
    pub decontracted: BTreeSet<PeerId>,
    /// Certificates dropped from the certificate store
    pub certificates_pruned: usize,
}

/// Peers the ramp-up expects to know `elapsed` after startup
///
/// Zero during the grace period, then growing linearly to `target` over `ramp_up`.
#[must_use]
pub fn expected_peer_count(
    target: usize,
    elapsed: TimeDelta,
    grace: TimeDelta,
    ramp_up: TimeDelta,
) -> usize {
    if elapsed < grace {
        return 0;
    }
    let ramp = ramp_up.num_seconds();
    if ramp <= 0 {
        return target;
    }
    let elapsed = u128::try_from(elapsed.num_seconds()).unwrap_or(0);
    let ramp = u128::try_from(ramp).unwrap_or(1);
    let expected = u128::try_from(target)
        .unwrap_or(u128::MAX)
        .saturating_mul(elapsed)
        / ramp;
    usize::try_from(expected).unwrap_or(usize::MAX).min(target)
}

/// Keeps the peer population at its target
pub struct Gatekeeper<I: NodeImplementation> {
    /// The contract manager whose peers are maintained
    manager: ContractManager<I>,
    /// Peer transport
    transport: Arc<I::Transport>,
    /// Peer certificates
    certificates: Arc<I::CertificateStore>,
    /// Number of contracted peers to maintain
    contract_target: usize,
    /// Maximum simultaneous connections
    max_connections: usize,
    /// Whether to dial public peers learned through PEX
    public_peer_search: bool,
    /// Bootstrap trackers
    trackers: Vec<SocketAddr>,
    /// Time after startup before trackers are considered
    bootstrap_grace: TimeDelta,
    /// Time over which the expected peer count reaches the target
    bootstrap_ramp_up: TimeDelta,
    /// Contracted peers rated below this after probation are dropped
    min_peer_rating: f64,
    /// Time after first contact before a rating is acted on
    rating_probation: TimeDelta,
    /// When the node started
    started_at: DateTime<Utc>,
    /// Addresses learned through PEX
    pex: Mutex<BoundedOrderedMap<PeerId, PexEntry>>,
    /// Peers reached by dialling a tracker
    tracker_peers: Mutex<BTreeSet<PeerId>>,
}

impl<I: NodeImplementation> Gatekeeper<I> {
    /// Create a gatekeeper for a node started at `started_at`
    #[must_use]
    pub fn new(
        manager: ContractManager<I>,
        config: &EngineConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        let collaborators = manager.collaborators();
        let transport = Arc::clone(&collaborators.transport);
        let certificates = Arc::clone(&collaborators.certificates);
        Self {
            manager,
            transport,
            certificates,
            contract_target: config.contract_target,
            max_connections: config.max_connections,
            public_peer_search: config.public_peer_search,
            trackers: config.trackers.clone(),
            bootstrap_grace: to_time_delta(config.bootstrap_grace),
            bootstrap_ramp_up: to_time_delta(config.bootstrap_ramp_up),
            min_peer_rating: config.min_peer_rating,
            rating_probation: to_time_delta(config.rating_probation),
            started_at,
            pex: Mutex::new(BoundedOrderedMap::new(config.pex_cache_capacity)),
            tracker_peers: Mutex::new(BTreeSet::new()),
        }
    }

    /// Remember where a peer can be reached
    pub fn learn_address(&self, entry: PexEntry) {
        if entry.peer == self.manager.my_id() {
            return;
        }
        let mut pex = self.pex.lock();
        if pex
            .get(&entry.peer)
            .map_or(true, |known| known.last_seen <= entry.last_seen)
        {
            pex.insert(entry.peer, entry);
        }
    }

    /// The cached address of a peer
    #[must_use]
    pub fn known_address(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.pex.lock().get(peer).map(|entry| entry.address)
    }

    /// Number of cached PEX entries
    #[must_use]
    pub fn pex_len(&self) -> usize {
        self.pex.lock().len()
    }

    /// Dial an address, remembering the peer that answered
    async fn dial(&self, address: SocketAddr) -> Option<PeerId> {
        match self.transport.connect(address).await {
            Ok(peer) => Some(peer),
            Err(e) => {
                debug!("Dialling {address} failed: {e}");
                None
            }
        }
    }

    /// One maintenance pass
    #[instrument(skip_all, fields(%now))]
    pub async fn tick(&self, now: DateTime<Utc>) -> GatekeeperReport {
        let mut report = GatekeeperReport::default();
        let contracts = self.manager.contracts();
        let mut connected = self.transport.connected_peers().await;

        for peer in contracts.contracted_peers().difference(&connected) {
            let Some(address) = self.known_address(peer) else {
                continue;
            };
            if self.dial(address).await == Some(*peer) {
                report.reconnected += 1;
            }
        }
        connected = self.transport.connected_peers().await;

        let required = self
            .contract_target
            .saturating_sub(contracts.contracted_count());
        let spare = i64::try_from(self.max_connections).unwrap_or(i64::MAX)
            - i64::try_from(connected.len()).unwrap_or(i64::MAX);

        if required > 0 {
            for peer in &connected {
                if let Err(e) = self.transport.send_message(peer, PeerMessage::PexRequest).await {
                    debug!("PEX request to {peer} failed: {e}");
                }
            }
            if self.public_peer_search {
                let candidates: Vec<SocketAddr> = self
                    .pex
                    .lock()
                    .iter()
                    .filter(|(peer, entry)| entry.public && !connected.contains(*peer))
                    .map(|(_, entry)| entry.address)
                    .take(required)
                    .collect();
                for address in candidates {
                    if self.dial(address).await.is_some() {
                        report.dialed += 1;
                    }
                }
            }
        }

        if let Some(address) = self.transport.external_address() {
            for peer in &connected {
                let announcement = PeerMessage::AddressAnnouncement(address);
                if let Err(e) = self.transport.send_message(peer, announcement).await {
                    debug!("Address announcement to {peer} failed: {e}");
                }
            }
        }

        if required > 0 && spare <= 0 {
            let trackers = self.tracker_peers.lock().clone();
            let evictable: Vec<PeerId> = connected
                .iter()
                .filter(|peer| !contracts.is_contracted(peer) && !trackers.contains(*peer))
                .take(required)
                .copied()
                .collect();
            for peer in evictable {
                info!("Disconnecting {peer} to make room");
                self.transport.disconnect(&peer).await;
                report.disconnected += 1;
            }
        }

        let known = {
            let mut known = contracts.contracted_peers();
            known.extend(self.transport.connected_peers().await);
            known.extend(self.pex.lock().iter().map(|(peer, _)| *peer));
            known.len()
        };
        let expected = expected_peer_count(
            self.contract_target,
            now - self.started_at,
            self.bootstrap_grace,
            self.bootstrap_ramp_up,
        );
        if known < expected {
            debug!("Know {known} peers, expected {expected}, dialling trackers");
            for tracker in &self.trackers {
                if let Some(peer) = self.dial(*tracker).await {
                    self.tracker_peers.lock().insert(peer);
                    report.trackers_dialed += 1;
                }
            }
        }

        for peer in contracts.contracted_peers() {
            let Some(first_contact) = self.manager.appraisals().first_contact(&peer) else {
                continue;
            };
            if now - first_contact < self.rating_probation {
                continue;
            }
            let rating = self.manager.appraisals().get_peer_rating(&peer, None);
            if rating < self.min_peer_rating {
                info!("De-contracting {peer}, rating {rating:.3}");
                self.manager.remove_contracted_peer(&peer).await;
                self.transport.disconnect(&peer).await;
                report.decontracted.insert(peer);
            }
        }
        report.certificates_pruned = self
            .certificates
            .prune(&contracts.contracted_peers())
            .await;

        report
    }

    /// Decide whether to contract a newly connected peer
    ///
    /// Returns whether the peer is contracted.
    ///
    /// # Errors
    /// If the certificate cannot be persisted
    #[instrument(skip_all, fields(%peer))]
    pub async fn on_peer_connected(
        &self,
        peer: PeerId,
        certificate: PeerCertificate,
    ) -> Result<bool, StoreError> {
        if !certificate.verify(&peer) {
            warn!("Certificate does not identify the peer, disconnecting");
            self.transport.disconnect(&peer).await;
            return Ok(false);
        }
        let admission = self
            .manager
            .try_add_contracted_peer(peer, self.contract_target);
        if !admission.is_contracted() {
            debug!("Peer not needed");
            return Ok(false);
        }
        self.certificates.persist(peer, certificate).await?;
        Ok(true)
    }

    /// Apply a PEX message from a peer
    ///
    /// # Errors
    /// If a PEX reply cannot be sent
    pub async fn handle_message(
        &self,
        sender: &PeerId,
        message: PeerMessage,
        now: DateTime<Utc>,
    ) -> Result<(), reliquary_types::traits::TransportError> {
        match message {
            PeerMessage::PexRequest => {
                let entries: Vec<PexEntry> = self
                    .pex
                    .lock()
                    .iter()
                    .filter(|(peer, _)| *peer != sender)
                    .map(|(_, entry)| entry.clone())
                    .collect();
                self.transport
                    .send_message(sender, PeerMessage::PexUpdate(entries))
                    .await?;
            }
            PeerMessage::PexUpdate(entries) => {
                for entry in entries {
                    self.learn_address(entry);
                }
            }
            PeerMessage::AddressAnnouncement(address) => self.learn_address(PexEntry {
                peer: *sender,
                address,
                public: true,
                last_seen: now,
            }),
            other => debug!("Gatekeeper ignores {}", other.purpose()),
        }
        Ok(())
    }
}
