// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Network message types
//!
//! This module contains types used to represent the various types of messages that
//! `Reliquary` nodes can send among themselves.

use std::{collections::BTreeSet, fmt, net::SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{BlockId, PexEntry};

/// Incoming message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Everything the sender holds on behalf of the recipient
    ContractUpdate(ContractUpdate),
    /// Challenges from a block owner to the holder
    EvidenceRequests(BTreeSet<EvidenceRequest>),
    /// Answers from a holder to the block owner
    EvidenceResponses(BTreeSet<EvidenceResponse>),
    /// A block the sender wants the recipient to hold
    BlockUpload(BlockUpload),
    /// Ask the recipient for the peers it knows
    PexRequest,
    /// Peers known to the sender
    PexUpdate(Vec<PexEntry>),
    /// The sender's externally reachable address
    AddressAnnouncement(SocketAddr),
}

impl PeerMessage {
    /// Serialize the message for the wire
    ///
    /// # Errors
    /// If bincode fails to serialize
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a message from the wire
    ///
    /// # Errors
    /// If the bytes are not a valid message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Short name of the variant, for logging
    #[must_use]
    pub fn purpose(&self) -> &'static str {
        match self {
            Self::ContractUpdate(_) => "contract_update",
            Self::EvidenceRequests(_) => "evidence_requests",
            Self::EvidenceResponses(_) => "evidence_responses",
            Self::BlockUpload(_) => "block_upload",
            Self::PexRequest => "pex_request",
            Self::PexUpdate(_) => "pex_update",
            Self::AddressAnnouncement(_) => "address_announcement",
        }
    }
}

/// Periodic report of the blocks the sender stores for the recipient
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractUpdate {
    /// Sender's clock, flattened to the hour
    pub hour_time: DateTime<Utc>,
    /// How many more blocks than the fleet average the sender will hold for the recipient
    pub allowed_inequality: i64,
    /// Blocks the sender currently stores for the recipient
    pub stored_block_ids: BTreeSet<BlockId>,
}

/// A block handed to a peer for storage
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUpload {
    /// Hash of the encrypted bytes
    pub block_id: BlockId,
    /// The encrypted block
    #[serde(with = "serde_bytes")]
    pub block_bytes: Vec<u8>,
}

impl fmt::Debug for BlockUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockUpload")
            .field("block_id", &self.block_id)
            .field("len", &self.block_bytes.len())
            .finish()
    }
}

/// The kind of proof asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EvidenceKind {
    /// Send the full block bytes
    SendBlock,
    /// Hash the block with a salt
    ComputeHash,
    /// Drop the block, the owner no longer relies on it
    DeleteBlock,
}

/// A challenge sent by a block owner to the holder
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvidenceRequest {
    /// The block
    pub block_id: BlockId,
    /// What is asked for
    pub kind: EvidenceKind,
    /// Salt for [`EvidenceKind::ComputeHash`], empty otherwise
    #[serde(with = "serde_bytes")]
    pub salt: Vec<u8>,
}

impl EvidenceRequest {
    /// Ask for the full block
    #[must_use]
    pub fn send_block(block_id: BlockId) -> Self {
        Self {
            block_id,
            kind: EvidenceKind::SendBlock,
            salt: Vec::new(),
        }
    }

    /// Ask for a salted hash of the block
    #[must_use]
    pub fn compute_hash(block_id: BlockId, salt: Vec<u8>) -> Self {
        Self {
            block_id,
            kind: EvidenceKind::ComputeHash,
            salt,
        }
    }

    /// Tell the holder to drop the block
    #[must_use]
    pub fn delete_block(block_id: BlockId) -> Self {
        Self {
            block_id,
            kind: EvidenceKind::DeleteBlock,
            salt: Vec::new(),
        }
    }
}

/// Payload of an evidence response
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EvidencePayload {
    /// The full block bytes
    Block(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Lowercase hex of the salted hash
    Digest(String),
}

impl fmt::Debug for EvidencePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block(bytes) => write!(f, "Block({} bytes)", bytes.len()),
            Self::Digest(digest) => write!(f, "Digest({digest})"),
        }
    }
}

/// A holder's answer to an evidence request
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvidenceResponse {
    /// The block
    pub block_id: BlockId,
    /// The proof
    pub payload: EvidencePayload,
}

impl EvidenceResponse {
    /// The kind of request this answers
    #[must_use]
    pub fn kind(&self) -> EvidenceKind {
        match self.payload {
            EvidencePayload::Block(_) => EvidenceKind::SendBlock,
            EvidencePayload::Digest(_) => EvidenceKind::ComputeHash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ContentHash;

    #[test]
    fn evidence_requests_collapse_in_a_set() {
        let id = ContentHash::of(b"block");
        let requests: BTreeSet<_> = [
            EvidenceRequest::send_block(id),
            EvidenceRequest::send_block(id),
            EvidenceRequest::delete_block(id),
        ]
        .into_iter()
        .collect();
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn message_survives_the_wire() {
        let message = PeerMessage::EvidenceResponses(
            [EvidenceResponse {
                block_id: ContentHash::of(b"block"),
                payload: EvidencePayload::Digest("ab".into()),
            }]
            .into_iter()
            .collect(),
        );
        let bytes = message.to_bytes().unwrap();
        assert_eq!(PeerMessage::from_bytes(&bytes).unwrap(), message);
        assert!(PeerMessage::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
