// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Testing harness for `Reliquary`: groups of in-memory nodes and helpers to drive the protocol
//! by hand
#![cfg_attr(
    not(any(test, debug_assertions)),
    deprecated = "suspicious usage of testing implementations in non-test/non-debug build"
)]

/// Helpers for building shards and journal entries and for moving messages between nodes
pub mod helpers;

/// context for a single node
pub mod node_ctx;

///  builder
pub mod test_builder;
