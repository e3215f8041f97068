// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_broadcast::{Receiver, Sender};
use async_trait::async_trait;
use chrono::Utc;
use reliquary_task::task::TaskState;
use reliquary_types::traits::NodeImplementation;
use tracing::{debug, info};

use crate::{
    contract_manager::ContractManager,
    engine::{Engine, EngineEvent},
    gatekeeper::Gatekeeper,
};

/// Trait for creating task states.
pub trait CreateTaskState<I: NodeImplementation> {
    /// Function to create the task state from a given engine.
    fn create_from(engine: &Engine<I>) -> Self;
}

/// Runs the contract cycle: garbage collection, distribution and contract updates
pub struct ContractCycleTaskState<I: NodeImplementation> {
    /// The manager driving the protocol
    pub manager: ContractManager<I>,
    /// Time between cycles
    pub period: Duration,
}

impl<I: NodeImplementation> CreateTaskState<I> for ContractCycleTaskState<I> {
    fn create_from(engine: &Engine<I>) -> Self {
        Self {
            manager: engine.manager().clone(),
            period: engine.config().contract_update_interval,
        }
    }
}

#[async_trait]
impl<I: NodeImplementation> TaskState for ContractCycleTaskState<I> {
    type Event = EngineEvent;

    fn period(&self) -> Option<Duration> {
        Some(self.period)
    }

    async fn cancel_subtasks(&mut self) {}

    async fn handle_event(
        &mut self,
        event: Arc<Self::Event>,
        _sender: &Sender<Arc<Self::Event>>,
        _receiver: &Receiver<Arc<Self::Event>>,
    ) -> Result<()> {
        if *event == EngineEvent::RunContractCycle {
            debug!("Contract cycle requested");
            self.manager.run_cycle(Utc::now()).await;
        }
        Ok(())
    }

    async fn periodic_task(&mut self, _task_id: usize, _sender: &Sender<Arc<Self::Event>>) {
        self.manager.run_cycle(Utc::now()).await;
    }
}

/// Advances the local uptime calculator
pub struct UptimeTaskState<I: NodeImplementation> {
    /// Owner of the appraisal ledger
    pub manager: ContractManager<I>,
    /// Time between ticks
    pub period: Duration,
}

impl<I: NodeImplementation> CreateTaskState<I> for UptimeTaskState<I> {
    fn create_from(engine: &Engine<I>) -> Self {
        Self {
            manager: engine.manager().clone(),
            period: engine.config().uptime_tick_interval,
        }
    }
}

#[async_trait]
impl<I: NodeImplementation> TaskState for UptimeTaskState<I> {
    type Event = EngineEvent;

    fn period(&self) -> Option<Duration> {
        Some(self.period)
    }

    async fn cancel_subtasks(&mut self) {}

    async fn handle_event(
        &mut self,
        _event: Arc<Self::Event>,
        _sender: &Sender<Arc<Self::Event>>,
        _receiver: &Receiver<Arc<Self::Event>>,
    ) -> Result<()> {
        Ok(())
    }

    async fn periodic_task(&mut self, _task_id: usize, _sender: &Sender<Arc<Self::Event>>) {
        self.manager.appraisals().tick(Utc::now());
    }
}

/// Maintains connections and contracts
pub struct GatekeeperTaskState<I: NodeImplementation> {
    /// The gatekeeper
    pub gatekeeper: Arc<Gatekeeper<I>>,
    /// Time between maintenance rounds
    pub period: Duration,
}

impl<I: NodeImplementation> CreateTaskState<I> for GatekeeperTaskState<I> {
    fn create_from(engine: &Engine<I>) -> Self {
        Self {
            gatekeeper: Arc::clone(engine.gatekeeper()),
            period: engine.config().gatekeeper_interval,
        }
    }
}

impl<I: NodeImplementation> GatekeeperTaskState<I> {
    /// One maintenance round
    async fn run(&self) {
        let report = self.gatekeeper.tick(Utc::now()).await;
        if !report.decontracted.is_empty() {
            info!("De-contracted {} peers", report.decontracted.len());
        }
        debug!(?report, "Gatekeeper round finished");
    }
}

#[async_trait]
impl<I: NodeImplementation> TaskState for GatekeeperTaskState<I> {
    type Event = EngineEvent;

    fn period(&self) -> Option<Duration> {
        Some(self.period)
    }

    async fn cancel_subtasks(&mut self) {}

    async fn handle_event(
        &mut self,
        event: Arc<Self::Event>,
        _sender: &Sender<Arc<Self::Event>>,
        _receiver: &Receiver<Arc<Self::Event>>,
    ) -> Result<()> {
        if *event == EngineEvent::RunGatekeeper {
            self.run().await;
        }
        Ok(())
    }

    async fn periodic_task(&mut self, _task_id: usize, _sender: &Sender<Arc<Self::Event>>) {
        self.run().await;
    }
}
