// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! The engine ties the ledgers, the contract manager and the gatekeeper to a transport and runs
//! them.
//!
//! On [`Engine::init`] the block key is derived and persisted state is loaded. [`Engine::start`]
//! spawns the periodic tasks and the network task; [`Engine::shut_down`] stops them, waits for
//! in-flight protocol work and writes the state back.

use std::sync::Arc;

use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender};
use chrono::Utc;
use reliquary_task::{
    task::{NetworkTaskRegistry, TaskEvent, TaskRegistry},
    worker_pool::WorkerPool,
};
use reliquary_types::{
    constants::{APPRAISAL_STATE_FILE, CONTRACT_STATE_DIR, EVENT_CHANNEL_SIZE},
    data::PeerId,
    error::PersistenceError,
    traits::{NodeImplementation, Transport},
    EngineConfig,
};
use tracing::{info, instrument};

use crate::{
    block_codec::SharedKey,
    contract_manager::{Collaborators, ContractManager},
    gatekeeper::Gatekeeper,
    tasks::{add_engine_tasks, add_network_event_task, request},
};

/// Events on the engine's internal stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// shut everything down
    Shutdown,
    /// run a contract cycle now instead of waiting for the next period
    RunContractCycle,
    /// run a gatekeeper round now
    RunGatekeeper,
}

impl TaskEvent for EngineEvent {
    fn shutdown_event() -> Self {
        EngineEvent::Shutdown
    }
}

/// A running storage contract node
pub struct Engine<I: NodeImplementation> {
    /// Configuration the engine was built with
    config: EngineConfig,
    /// The protocol driver
    manager: ContractManager<I>,
    /// Connection and contract maintenance
    gatekeeper: Arc<Gatekeeper<I>>,
    /// Runs protocol work off the task loops
    pool: WorkerPool,
    /// The internal event stream shared by all tasks
    internal_event_stream: (Sender<Arc<EngineEvent>>, InactiveReceiver<Arc<EngineEvent>>),
    /// Periodic tasks
    registry: TaskRegistry<EngineEvent>,
    /// Transport receive loops
    network_registry: NetworkTaskRegistry,
}

impl<I: NodeImplementation> Engine<I> {
    /// Build an engine and load any persisted state
    ///
    /// The shared block key is derived here, once.
    ///
    /// # Errors
    /// If persisted state exists but cannot be read
    #[instrument(skip_all, fields(%my_id))]
    pub async fn init(
        my_id: PeerId,
        config: EngineConfig,
        collaborators: Collaborators<I>,
    ) -> Result<Self, PersistenceError> {
        let key = SharedKey::from_passphrase(&config.shared_passphrase);
        let pool = WorkerPool::new(config.worker_pool_size);
        let manager = ContractManager::new(my_id, &config, key, collaborators, pool.clone());

        if let Some(dir) = &config.state_dir {
            let contracts = manager
                .contracts()
                .load_from(&dir.join(CONTRACT_STATE_DIR))
                .await?;
            let appraisals = manager
                .appraisals()
                .load_from(&dir.join(APPRAISAL_STATE_FILE))
                .await?;
            info!(
                "Loaded {contracts} contracts and {} appraisals from {}",
                if appraisals { "saved" } else { "no" },
                dir.display()
            );
        }

        let gatekeeper = Arc::new(Gatekeeper::new(manager.clone(), &config, Utc::now()));

        let (mut internal_tx, internal_rx) = broadcast(EVENT_CHANNEL_SIZE);
        internal_tx.set_await_active(false);
        internal_tx.set_overflow(true);

        Ok(Self {
            config,
            manager,
            gatekeeper,
            pool,
            internal_event_stream: (internal_tx, internal_rx.deactivate()),
            registry: TaskRegistry::new(),
            network_registry: NetworkTaskRegistry::new(),
        })
    }

    /// Spawn the periodic tasks and the network task. Starting twice does nothing.
    pub fn start(&mut self) {
        if !self.registry.is_empty() {
            return;
        }
        info!("Starting engine for {}", self.manager.my_id());
        let mut registry = TaskRegistry::new();
        add_engine_tasks(&mut registry, self);
        let mut network_registry = NetworkTaskRegistry::new();
        add_network_event_task(&mut network_registry, self);
        self.registry = registry;
        self.network_registry = network_registry;
    }

    /// Whether the tasks are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.registry.is_empty()
    }

    /// Ask the running tasks to do something now
    pub async fn request(&self, event: EngineEvent) {
        request(&self.internal_event_stream.0, event).await;
    }

    /// Stop every task, wait for protocol work in flight, then persist state
    ///
    /// # Errors
    /// If state cannot be written
    pub async fn shut_down(&mut self) -> Result<(), PersistenceError> {
        info!("Shutting down engine for {}", self.manager.my_id());
        if self.is_running() {
            self.request(EngineEvent::Shutdown).await;
            self.registry.shutdown().await;
        }
        self.network_registry.shutdown().await;
        self.manager.collaborators().transport.shut_down().await;
        self.pool.drain().await;
        self.pool.shutdown().await;
        self.persist().await
    }

    /// Write contracts and appraisals to the state directory, if one is configured
    ///
    /// # Errors
    /// If state cannot be written
    pub async fn persist(&self) -> Result<(), PersistenceError> {
        let Some(dir) = &self.config.state_dir else {
            return Ok(());
        };
        self.manager
            .contracts()
            .persist_to(&dir.join(CONTRACT_STATE_DIR))
            .await?;
        self.manager
            .appraisals()
            .persist_to(&dir.join(APPRAISAL_STATE_FILE))
            .await
    }

    /// The configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The protocol driver
    #[must_use]
    pub fn manager(&self) -> &ContractManager<I> {
        &self.manager
    }

    /// The gatekeeper
    #[must_use]
    pub fn gatekeeper(&self) -> &Arc<Gatekeeper<I>> {
        &self.gatekeeper
    }

    /// The worker pool
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// A sender and an active receiver on the internal event stream
    #[must_use]
    pub fn internal_event_stream(&self) -> (Sender<Arc<EngineEvent>>, Receiver<Arc<EngineEvent>>) {
        (
            self.internal_event_stream.0.clone(),
            self.internal_event_stream.1.activate_cloned(),
        )
    }
}
