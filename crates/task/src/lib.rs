// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Task primitives for `Reliquary`

/// Event-loop tasks and their registries
pub mod task;
/// Bounded pool for short-lived protocol work
pub mod worker_pool;
