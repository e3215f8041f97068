// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! In memory network simulator
//!
//! This module provides an in-memory only simulation of a peer-to-peer transport, useful for unit
//! and integration tests. Messages are serialized on send and deserialized on receive so that the
//! wire format is exercised even without sockets.

use std::{
    collections::BTreeSet,
    fmt::Debug,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_lock::{Mutex, RwLock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use reliquary_types::{
    constants::TRANSPORT_CHANNEL_SIZE,
    data::{PeerCertificate, PeerId},
    message::PeerMessage,
    traits::{
        network::{FailedToDeserializeSnafu, FailedToSerializeSnafu},
        Transport, TransportError, TransportEvent,
    },
};
use snafu::ResultExt;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};
use tracing::{debug, info, trace, warn};

/// What travels through a node's inbound queue
#[derive(Debug)]
enum Frame {
    /// A serialized [`PeerMessage`]
    Message {
        /// who sent it
        sender: PeerId,
        /// the encoded message
        bytes: Vec<u8>,
    },
    /// A connection was opened
    Connected {
        /// the other end
        peer: PeerId,
        /// its certificate
        certificate: PeerCertificate,
    },
    /// A connection was closed
    Disconnected {
        /// the other end
        peer: PeerId,
    },
}

/// Shared state for in-memory mock networking.
///
/// This type is responsible for keeping track of every [`MemoryNetwork`] in a group and of the
/// addresses they can be dialled at.
#[derive(Default)]
pub struct MasterMap {
    /// The `MemoryNetwork`s by peer
    map: DashMap<PeerId, MemoryNetwork>,
    /// Listening addresses
    addresses: DashMap<SocketAddr, PeerId>,
}

impl Debug for MasterMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterMap")
            .field("nodes", &self.map.len())
            .finish()
    }
}

impl MasterMap {
    /// Create a new, empty, `MasterMap`
    #[must_use]
    pub fn new() -> Arc<MasterMap> {
        Arc::new(MasterMap::default())
    }

    /// Number of attached networks
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no network is attached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Internal state for a `MemoryNetwork` instance
struct MemoryNetworkInner {
    /// This node
    my_id: PeerId,
    /// The certificate presented on connection
    certificate: PeerCertificate,
    /// Where this node listens, if anywhere
    address: Option<SocketAddr>,
    /// Input for frames
    input: RwLock<Option<Sender<Frame>>>,
    /// Output for frames
    output: Mutex<Receiver<Frame>>,
    /// Open connections
    connections: DashSet<PeerId>,
    /// The master map
    master_map: Arc<MasterMap>,
    /// Number of messages sent by this node
    sent_message_count: AtomicUsize,
}

/// In memory only network simulator.
///
/// This provides an in memory simulation of a transport, allowing nodes running on the same
/// machine to mock networking while testing other functionality.
///
/// Under the hood, every instance owns a bounded mpsc queue that the other instances of the same
/// group push into.
#[derive(Clone)]
pub struct MemoryNetwork {
    /// The actual internal state
    inner: Arc<MemoryNetworkInner>,
}

impl Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("my_id", &self.inner.my_id)
            .field("address", &self.inner.address)
            .finish()
    }
}

impl MemoryNetwork {
    /// Creates a new `MemoryNetwork` and hooks it up to the group through the provided `MasterMap`
    ///
    /// The node's id is derived from its certificate. With an `address`, other members can
    /// [`Transport::connect`] to it.
    #[must_use]
    pub fn new(
        certificate: PeerCertificate,
        address: Option<SocketAddr>,
        master_map: &Arc<MasterMap>,
    ) -> Arc<Self> {
        Self::attach(certificate.peer_id(), certificate, address, master_map)
    }

    /// A network alone in its own group, for tests that never reach a peer
    #[must_use]
    pub fn isolated(my_id: PeerId) -> Arc<Self> {
        let certificate = PeerCertificate {
            der: my_id.to_hex().into_bytes(),
            issued_at: DateTime::<Utc>::UNIX_EPOCH,
        };
        Self::attach(my_id, certificate, None, &MasterMap::new())
    }

    /// Register a node with the group
    fn attach(
        my_id: PeerId,
        certificate: PeerCertificate,
        address: Option<SocketAddr>,
        master_map: &Arc<MasterMap>,
    ) -> Arc<Self> {
        info!(%my_id, "Attaching new MemoryNetwork");
        let (input, output) = channel(TRANSPORT_CHANNEL_SIZE);
        let network = MemoryNetwork {
            inner: Arc::new(MemoryNetworkInner {
                my_id,
                certificate,
                address,
                input: RwLock::new(Some(input)),
                output: Mutex::new(output),
                connections: DashSet::new(),
                master_map: Arc::clone(master_map),
                sent_message_count: AtomicUsize::new(0),
            }),
        };
        master_map.map.insert(my_id, network.clone());
        if let Some(address) = address {
            master_map.addresses.insert(address, my_id);
        }
        Arc::new(network)
    }

    /// Number of messages this node has sent
    #[must_use]
    pub fn sent_message_count(&self) -> usize {
        self.inner.sent_message_count.load(Ordering::Relaxed)
    }

    /// Queue a frame for this node
    async fn deliver(&self, frame: Frame) -> Result<(), TransportError> {
        let input = self.inner.input.read().await;
        let Some(input) = input.as_ref() else {
            return Err(TransportError::PeerUnavailable {
                peer: self.inner.my_id,
            });
        };
        input.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::BufferFull {
                peer: self.inner.my_id,
            },
            TrySendError::Closed(_) => TransportError::PeerUnavailable {
                peer: self.inner.my_id,
            },
        })
    }

    /// Another member of the group
    fn member(&self, peer: &PeerId) -> Option<MemoryNetwork> {
        self.inner
            .master_map
            .map
            .get(peer)
            .map(|entry| entry.value().clone())
    }

    /// Close one side of a connection, notifying this node
    async fn drop_connection(&self, peer: &PeerId) {
        if self.inner.connections.remove(peer).is_some() {
            if let Err(e) = self.deliver(Frame::Disconnected { peer: *peer }).await {
                trace!("Disconnect notice for {} dropped: {e}", self.inner.my_id);
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    fn my_uid(&self) -> PeerId {
        self.inner.my_id
    }

    fn external_address(&self) -> Option<SocketAddr> {
        self.inner.address
    }

    async fn peer_connected(&self, peer: &PeerId) -> bool {
        self.inner.connections.contains(peer)
    }

    async fn connected_peers(&self) -> BTreeSet<PeerId> {
        self.inner.connections.iter().map(|peer| *peer).collect()
    }

    async fn send_message(
        &self,
        peer: &PeerId,
        message: PeerMessage,
    ) -> Result<(), TransportError> {
        if !self.inner.connections.contains(peer) {
            return Err(TransportError::PeerUnavailable { peer: *peer });
        }
        let Some(remote) = self.member(peer) else {
            return Err(TransportError::PeerUnavailable { peer: *peer });
        };
        trace!("Sending {} to {peer}", message.purpose());
        let bytes = message.to_bytes().context(FailedToSerializeSnafu)?;
        remote.deliver(Frame::Message {
            sender: self.inner.my_id,
            bytes,
        })
        .await?;
        self.inner.sent_message_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recv_event(&self) -> Result<TransportEvent, TransportError> {
        let frame = self
            .inner
            .output
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ShutDown)?;
        Ok(match frame {
            Frame::Message { sender, bytes } => TransportEvent::Message {
                sender,
                message: PeerMessage::from_bytes(&bytes).context(FailedToDeserializeSnafu)?,
            },
            Frame::Connected { peer, certificate } => {
                TransportEvent::Connected { peer, certificate }
            }
            Frame::Disconnected { peer } => TransportEvent::Disconnected { peer },
        })
    }

    async fn connect(&self, address: SocketAddr) -> Result<PeerId, TransportError> {
        let unreachable = TransportError::Unreachable { address };
        let Some(peer) = self
            .inner
            .master_map
            .addresses
            .get(&address)
            .map(|entry| *entry.value())
        else {
            return Err(unreachable);
        };
        if peer == self.inner.my_id {
            return Err(unreachable);
        }
        if self.inner.connections.contains(&peer) {
            return Ok(peer);
        }
        let Some(remote) = self.member(&peer) else {
            return Err(unreachable);
        };

        remote.deliver(Frame::Connected {
            peer: self.inner.my_id,
            certificate: self.inner.certificate.clone(),
        })
        .await?;
        remote.inner.connections.insert(self.inner.my_id);
        self.inner.connections.insert(peer);
        self.deliver(Frame::Connected {
            peer,
            certificate: remote.inner.certificate.clone(),
        })
        .await?;
        debug!("{} connected to {peer}", self.inner.my_id);
        Ok(peer)
    }

    async fn disconnect(&self, peer: &PeerId) {
        self.drop_connection(peer).await;
        if let Some(remote) = self.member(peer) {
            remote.drop_connection(&self.inner.my_id).await;
        }
    }

    async fn shut_down(&self) {
        let my_id = self.inner.my_id;
        let peers: Vec<PeerId> = self.inner.connections.iter().map(|peer| *peer).collect();
        for peer in &peers {
            self.disconnect(peer).await;
        }
        self.inner.master_map.map.remove(&my_id);
        if let Some(address) = self.inner.address {
            self.inner.master_map.addresses.remove(&address);
        }
        if self.inner.input.write().await.take().is_none() {
            warn!("MemoryNetwork {my_id} was already shut down");
        }
    }
}
