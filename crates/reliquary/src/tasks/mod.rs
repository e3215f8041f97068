// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Provides a number of tasks that run continuously

/// Provides trait to create task states from an `Engine`
pub mod task_state;

use std::sync::Arc;

use async_broadcast::Sender;
use chrono::Utc;
use reliquary_task::task::{NetworkTaskRegistry, Task, TaskRegistry, TaskState};
use reliquary_types::{
    message::PeerMessage,
    traits::{NodeImplementation, Transport, TransportError, TransportEvent},
};
use tracing::{debug, info, trace, warn};

use crate::{
    engine::{Engine, EngineEvent},
    tasks::task_state::{
        ContractCycleTaskState, CreateTaskState, GatekeeperTaskState, UptimeTaskState,
    },
};

/// Build a task state from the engine and run it
fn add_task<I, S>(registry: &mut TaskRegistry<EngineEvent>, engine: &Engine<I>, task_id: usize)
where
    I: NodeImplementation,
    S: CreateTaskState<I> + TaskState<Event = EngineEvent> + Send + 'static,
{
    let (sender, receiver) = engine.internal_event_stream();
    let task = Task::new(S::create_from(engine), sender, receiver, task_id);
    registry.run_task(task);
}

/// Add the periodic tasks: contract cycle, uptime tick and gatekeeper maintenance
pub fn add_engine_tasks<I: NodeImplementation>(
    registry: &mut TaskRegistry<EngineEvent>,
    engine: &Engine<I>,
) {
    add_task::<I, ContractCycleTaskState<I>>(registry, engine, 0);
    add_task::<I, UptimeTaskState<I>>(registry, engine, 1);
    add_task::<I, GatekeeperTaskState<I>>(registry, engine, 2);
}

/// Add the task that receives transport events and dispatches them
///
/// Every message is handled on the worker pool so that one slow peer cannot hold up the others.
/// Connections are handled inline; a peer that gets newly contracted triggers a contract cycle.
pub fn add_network_event_task<I: NodeImplementation>(
    registry: &mut NetworkTaskRegistry,
    engine: &Engine<I>,
) {
    let manager = engine.manager().clone();
    let gatekeeper = Arc::clone(engine.gatekeeper());
    let transport = Arc::clone(&manager.collaborators().transport);
    let pool = engine.pool().clone();
    let (sender, _) = engine.internal_event_stream();

    let handle = tokio::spawn(async move {
        loop {
            let event = match transport.recv_event().await {
                Ok(event) => event,
                Err(TransportError::ShutDown) => {
                    info!("Transport shut down, network task exiting");
                    break;
                }
                Err(e) => {
                    warn!("Dropping transport event: {e}");
                    continue;
                }
            };
            match event {
                TransportEvent::Message { sender: peer, message } => {
                    trace!("{} from {peer}", message.purpose());
                    let now = Utc::now();
                    if is_pex(&message) {
                        let gatekeeper = Arc::clone(&gatekeeper);
                        pool.spawn(async move {
                            if let Err(e) = gatekeeper.handle_message(&peer, message, now).await {
                                warn!("PEX exchange with {peer} failed: {e}");
                            }
                        });
                    } else {
                        let manager = manager.clone();
                        pool.spawn(async move {
                            if let Err(e) = manager.handle_message(&peer, message, now).await {
                                warn!("Message from {peer} rejected: {e}");
                            }
                        });
                    }
                }
                // handled in order, so the peer is contracted before its first message
                TransportEvent::Connected { peer, certificate } => {
                    match gatekeeper.on_peer_connected(peer, certificate).await {
                        Ok(true) => request(&sender, EngineEvent::RunContractCycle).await,
                        Ok(false) => {}
                        Err(e) => warn!("Cannot keep certificate of {peer}: {e}"),
                    }
                }
                TransportEvent::Disconnected { peer } => debug!("{peer} disconnected"),
            }
        }
    });
    registry.register(handle);
}

/// Whether a message belongs to peer exchange rather than the contract protocol
fn is_pex(message: &PeerMessage) -> bool {
    matches!(
        message,
        PeerMessage::PexRequest | PeerMessage::PexUpdate(_) | PeerMessage::AddressAnnouncement(_)
    )
}

/// Broadcast an event to every engine task, ignoring a closed stream
pub async fn request(sender: &Sender<Arc<EngineEvent>>, event: EngineEvent) {
    if let Err(e) = sender.broadcast_direct(Arc::new(event)).await {
        debug!("Engine event not delivered: {e}");
    }
}
