// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Collaborator traits consumed by the `Reliquary` engine
pub mod backup;
pub mod identity;
pub mod network;
pub mod node_implementation;
pub mod storage;

pub use backup::BackupLedger;
pub use identity::CertificateStore;
pub use network::{Transport, TransportError, TransportEvent};
pub use node_implementation::NodeImplementation;
pub use storage::ContentStore;
