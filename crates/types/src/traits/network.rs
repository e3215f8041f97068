// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Network access compatibility
//!
//! Contains types and traits used by `Reliquary` to abstract over network access. Connection
//! establishment, TLS and NAT traversal are the transport's business; the engine only sees peers,
//! messages and connection events.

use std::{collections::BTreeSet, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;
use tokio::time::error::Elapsed as TimeoutError;

use crate::{
    data::{BlockId, PeerCertificate, PeerId},
    message::{BlockUpload, ContractUpdate, PeerMessage},
};

/// Error type for networking
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// The peer is not connected or did not become available in time
    #[snafu(display("peer {peer} unavailable"))]
    PeerUnavailable {
        /// the peer
        peer: PeerId,
    },
    /// The outgoing buffer towards a peer is full
    #[snafu(display("send buffer towards {peer} is full"))]
    BufferFull {
        /// the peer
        peer: PeerId,
    },
    /// No peer answered at the address
    #[snafu(display("no peer reachable at {address}"))]
    Unreachable {
        /// the address dialled
        address: SocketAddr,
    },
    /// Failed to serialize a network message
    FailedToSerialize {
        /// Originating bincode error
        source: bincode::Error,
    },
    /// Failed to deserialize a network message
    FailedToDeserialize {
        /// originating bincode error
        source: bincode::Error,
    },
    /// A timeout occurred
    Timeout {
        /// Source of error
        source: TimeoutError,
    },
    /// The underlying connection has been shut down
    ShutDown,
}

/// Something the transport observed
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A message arrived from a connected peer
    Message {
        /// who sent it
        sender: PeerId,
        /// what was sent
        message: PeerMessage,
    },
    /// A connection was established
    Connected {
        /// the peer
        peer: PeerId,
        /// the certificate the peer presented
        certificate: PeerCertificate,
    },
    /// A connection was lost
    Disconnected {
        /// the peer
        peer: PeerId,
    },
}

/// represents a networking implementation
/// exposes low level API for interacting with a network
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The id of this node
    fn my_uid(&self) -> PeerId;

    /// The address other peers can reach this node at, if known
    fn external_address(&self) -> Option<SocketAddr>;

    /// Whether a peer currently has an open connection
    async fn peer_connected(&self, peer: &PeerId) -> bool;

    /// All peers with an open connection
    async fn connected_peers(&self) -> BTreeSet<PeerId>;

    /// Send a message to a connected peer
    ///
    /// # Errors
    /// If the peer is unavailable or the message could not be queued
    async fn send_message(&self, peer: &PeerId, message: PeerMessage)
        -> Result<(), TransportError>;

    /// Hand a block to a peer for storage
    ///
    /// # Errors
    /// If the block could not be sent
    async fn upload_block(
        &self,
        peer: &PeerId,
        block_id: BlockId,
        block_bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.send_message(
            peer,
            PeerMessage::BlockUpload(BlockUpload {
                block_id,
                block_bytes,
            }),
        )
        .await
    }

    /// Report everything held on behalf of a peer
    ///
    /// # Errors
    /// If the update could not be sent
    async fn send_contract_update(
        &self,
        peer: &PeerId,
        hour_time: DateTime<Utc>,
        allowed_inequality: i64,
        stored_block_ids: BTreeSet<BlockId>,
    ) -> Result<(), TransportError> {
        self.send_message(
            peer,
            PeerMessage::ContractUpdate(ContractUpdate {
                hour_time,
                allowed_inequality,
                stored_block_ids,
            }),
        )
        .await
    }

    /// Wait for the next transport event
    ///
    /// # Errors
    /// If the transport has shut down. No further events will arrive.
    async fn recv_event(&self) -> Result<TransportEvent, TransportError>;

    /// Dial an address
    ///
    /// # Errors
    /// If nothing answers at the address
    async fn connect(&self, address: SocketAddr) -> Result<PeerId, TransportError>;

    /// Close the connection to a peer
    async fn disconnect(&self, peer: &PeerId);

    /// Shut the transport down, ending the event stream
    async fn shut_down(&self);
}

/// Wait until `peer` is connected, bounded by `timeout`
///
/// # Errors
/// [`TransportError::PeerUnavailable`] if the peer did not connect in time
pub async fn wait_for_peer<T: Transport + ?Sized>(
    transport: &T,
    peer: &PeerId,
    timeout: Duration,
) -> Result<(), TransportError> {
    let poll = async {
        loop {
            if transport.peer_connected(peer).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| TransportError::PeerUnavailable { peer: *peer })
}
