// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Provides a peer-to-peer storage contract engine
//!
//! Nodes pack their backup shards into encrypted blocks, place the blocks with contracted peers
//! and challenge those peers every hour to prove they still hold them. Peers that answer keep
//! their rating, peers that do not lose it and eventually their contract.
#![warn(
    clippy::all,
    clippy::pedantic,
    rust_2018_idioms,
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::panic
)]
#![allow(clippy::module_name_repetitions)]

pub mod appraisal_ledger;
pub mod block_codec;
pub mod block_ledger;
pub mod contract_manager;
pub mod contract_store;
pub mod engine;
pub mod evidence_ledger;
pub mod gatekeeper;
pub mod tasks;

pub use contract_manager::{Collaborators, ContractManager};
pub use engine::{Engine, EngineEvent};
pub use gatekeeper::Gatekeeper;
pub use reliquary_types::error::ContractError;
