// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Composite trait for node behavior
//!
//! This module defines the [`NodeImplementation`] trait, which is a composite trait used for
//! describing the collaborators a `Reliquary` node is built from.

use super::{BackupLedger, CertificateStore, ContentStore, Transport};

/// Node implementation aggregate trait
///
/// This trait exists to collect multiple behavior implementations into one type, to allow
/// `Reliquary` to avoid annoying numbers of type arguments and type patching.
///
/// It is recommended you implement this trait on a zero sized type, as `Reliquary` does not
/// actually store or keep a reference to any value implementing this trait.
pub trait NodeImplementation: Send + Sync + Clone + 'static {
    /// Transport the node talks to its peers over
    type Transport: Transport;

    /// Store for this node's own shards
    type ShardStore: ContentStore;

    /// Store for blocks held on behalf of peers
    type BlockStore: ContentStore;

    /// The local file-version journal
    type BackupLedger: BackupLedger;

    /// Store of peer certificates
    type CertificateStore: CertificateStore;
}
