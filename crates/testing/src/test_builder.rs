// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

use std::{sync::Arc, time::Duration};

use reliquary::ContractManager;
use reliquary_example_types::{network_types::MasterMap, node_types::MemoryImpl};
use reliquary_types::EngineConfig;

use crate::node_ctx::TestNode;

/// Passphrase shared by every node of a test group
pub const TEST_PASSPHRASE: &str = "reliquary test group";

/// data describing a test group
#[derive(Clone, Debug)]
pub struct TestDescription {
    /// Number of nodes
    pub num_nodes: u64,
    /// Configuration every node starts from
    pub config: EngineConfig,
}

impl Default for TestDescription {
    fn default() -> Self {
        Self {
            num_nodes: 2,
            config: EngineConfig {
                shared_passphrase: TEST_PASSPHRASE.to_string(),
                worker_pool_size: 4,
                ..EngineConfig::default()
            },
        }
    }
}

impl TestDescription {
    /// A group whose engines cycle fast enough for tests to watch them
    #[must_use]
    pub fn fast_engines(num_nodes: u64) -> Self {
        let default = Self::default();
        Self {
            num_nodes,
            config: EngineConfig {
                contract_update_interval: Duration::from_millis(150),
                uptime_tick_interval: Duration::from_millis(50),
                gatekeeper_interval: Duration::from_millis(200),
                bootstrap_grace: Duration::ZERO,
                bootstrap_ramp_up: Duration::ZERO,
                ..default.config
            },
        }
    }

    /// Attach the nodes to a fresh group
    #[must_use]
    pub fn build(self) -> TestGroup {
        let master_map = MasterMap::new();
        let nodes = (0..self.num_nodes)
            .map(|index| TestNode::new(index, &master_map))
            .collect();
        TestGroup {
            master_map,
            nodes,
            config: self.config,
        }
    }
}

/// A group of nodes sharing one in-memory network
#[derive(Debug)]
pub struct TestGroup {
    /// The shared network state
    pub master_map: Arc<MasterMap>,
    /// The nodes
    pub nodes: Vec<TestNode>,
    /// Configuration every node starts from
    pub config: EngineConfig,
}

impl TestGroup {
    /// Node `index`
    ///
    /// # Panics
    /// If there is no such node
    #[must_use]
    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// A contract manager per node, every node connected to and contracted with every other
    ///
    /// # Panics
    /// If the nodes cannot reach each other
    pub async fn contracted_managers(&self) -> Vec<ContractManager<MemoryImpl>> {
        let managers: Vec<_> = self
            .nodes
            .iter()
            .map(|node| node.manager(&self.config))
            .collect();
        for (i, node) in self.nodes.iter().enumerate() {
            for other in &self.nodes[i + 1..] {
                node.connect(other).await.unwrap();
            }
        }
        for (manager, node) in managers.iter().zip(&self.nodes) {
            for other in &self.nodes {
                if other.index != node.index {
                    manager.add_contracted_peer(other.id());
                }
            }
        }
        managers
    }
}
