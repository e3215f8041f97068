// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Provides types useful for representing `Reliquary`'s data structures
//!
//! This module provides types for content addressing, peer identity, journal entries and peer
//! exchange records.

use std::{
    collections::BTreeSet,
    fmt::{self, Debug, Display},
    net::SocketAddr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 256 bit BLAKE3 digest identifying a piece of content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

/// The content hash of a shard
pub type ShardHash = ContentHash;

/// The content hash of a block's encrypted bytes
pub type BlockId = ContentHash;

impl ContentHash {
    /// Hash some bytes
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Wrap raw digest bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether `bytes` hash to this value
    #[must_use]
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Self::of(bytes) == *self
    }

    /// Lowercase hex form
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Parse from a hex string
    ///
    /// # Errors
    /// If the string is not 64 hex characters
    pub fn from_hex(s: &str) -> Result<Self, blake3::HexError> {
        Ok(Self(*blake3::Hash::from_hex(s)?.as_bytes()))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}..)", &self.to_hex()[..12])
    }
}

/// Identity of a peer in the backup network
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive the id belonging to a certificate
    #[must_use]
    pub fn from_certificate_bytes(der: &[u8]) -> Self {
        Self(*blake3::hash(der).as_bytes())
    }

    /// Wrap raw id bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// generate a deterministic peer id from a seed and an index, for tests and simulation
    #[must_use]
    pub fn generated_from_seed_indexed(seed: [u8; 32], index: u64) -> Self {
        PeerCertificate::generated_from_seed_indexed(seed, index).peer_id()
    }

    /// Lowercase hex form
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

/// A peer's identity certificate, as handed over by the transport on connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCertificate {
    /// Encoded certificate bytes
    #[serde(with = "serde_bytes")]
    pub der: Vec<u8>,
    /// When the certificate was issued
    pub issued_at: DateTime<Utc>,
}

impl PeerCertificate {
    /// The id this certificate identifies
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_certificate_bytes(&self.der)
    }

    /// Whether this certificate identifies `peer`
    #[must_use]
    pub fn verify(&self, peer: &PeerId) -> bool {
        self.peer_id() == *peer
    }

    /// generate a deterministic certificate from a seed and an index
    #[must_use]
    pub fn generated_from_seed_indexed(seed: [u8; 32], index: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seed);
        hasher.update(&index.to_le_bytes());
        Self {
            der: hasher.finalize().as_bytes().to_vec(),
            issued_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Debug for PeerCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerCertificate")
            .field("peer", &self.peer_id())
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// A backup journal entry: one version of one file and the shards it is made of
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Path of the file relative to the backup root
    pub path: String,
    /// Monotonic version of the file
    pub version: u64,
    /// When this version was recorded
    pub modified: DateTime<Utc>,
    /// Shards making up this version, in order
    pub shards: Vec<ShardHash>,
}

impl JournalEntry {
    /// Whether this entry references `shard`
    #[must_use]
    pub fn references(&self, shard: &ShardHash) -> bool {
        self.shards.contains(shard)
    }

    /// Distinct shards referenced by this entry
    #[must_use]
    pub fn shard_set(&self) -> BTreeSet<ShardHash> {
        self.shards.iter().copied().collect()
    }
}

/// A peer exchange record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PexEntry {
    /// The peer
    pub peer: PeerId,
    /// Where it was last reachable
    pub address: SocketAddr,
    /// Whether the peer accepts unsolicited connections
    pub public: bool,
    /// When this record was last refreshed
    pub last_seen: DateTime<Utc>,
}
