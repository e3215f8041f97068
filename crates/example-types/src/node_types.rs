// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

use reliquary_types::traits::NodeImplementation;

use crate::{
    network_types::MemoryNetwork,
    storage_types::{MemoryBackupLedger, MemoryCertificateStore, MemoryContentStore},
};

#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
/// filler struct to implement node implementation and allow us
/// to select our collaborators
pub struct MemoryImpl;

impl NodeImplementation for MemoryImpl {
    type Transport = MemoryNetwork;
    type ShardStore = MemoryContentStore;
    type BlockStore = MemoryContentStore;
    type BackupLedger = MemoryBackupLedger;
    type CertificateStore = MemoryCertificateStore;
}
