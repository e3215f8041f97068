// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! In-memory collaborators for tests and simulations

/// in-memory transport
pub mod network_types;

/// node types
pub mod node_types;

/// in-memory content stores, backup journal and certificate store
pub mod storage_types;
