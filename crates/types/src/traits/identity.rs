// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Peer identity persistence

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::{
    data::{PeerCertificate, PeerId},
    error::StoreError,
};

/// Keeps the certificates of contracted peers
#[async_trait]
pub trait CertificateStore: Send + Sync + 'static {
    /// Remember a peer's certificate
    ///
    /// # Errors
    /// If the certificate does not identify `peer` or cannot be written
    async fn persist(&self, peer: PeerId, certificate: PeerCertificate) -> Result<(), StoreError>;

    /// A previously persisted certificate
    async fn get(&self, peer: &PeerId) -> Option<PeerCertificate>;

    /// Drop every certificate not belonging to `keep`, returning how many were dropped
    async fn prune(&self, keep: &BTreeSet<PeerId>) -> usize;
}
