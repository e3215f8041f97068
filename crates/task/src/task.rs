// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_broadcast::{Receiver, RecvError, Sender};
use async_trait::async_trait;
use tokio::{
    task::{spawn, JoinHandle},
    time::{interval, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

/// Trait for events that long-running tasks handle
pub trait TaskEvent: PartialEq {
    /// The shutdown signal for this event type
    ///
    /// Note that this is necessarily uniform across all tasks.
    /// Exiting the task loop is handled by the task spawner, rather than the task individually.
    fn shutdown_event() -> Self;
}

#[async_trait]
/// Type for mutable task state that can be used as the state for a `Task`
pub trait TaskState: Send {
    /// Type of event sent and received by the task
    type Event: TaskEvent + Clone + Send + Sync;

    /// How often [`TaskState::periodic_task`] runs. `None` disables the heartbeat.
    fn period(&self) -> Option<Duration> {
        None
    }

    /// Joins all subtasks.
    async fn cancel_subtasks(&mut self);

    /// Handles an event, providing direct access to the specific channel we received the event on.
    async fn handle_event(
        &mut self,
        event: Arc<Self::Event>,
        _sender: &Sender<Arc<Self::Event>>,
        _receiver: &Receiver<Arc<Self::Event>>,
    ) -> Result<()>;

    /// Runs a specified job in the main task every [`TaskState::period`]
    async fn periodic_task(&mut self, task_id: usize, sender: &Sender<Arc<Self::Event>>);
}

/// Why a task loop stopped
enum Exit {
    /// The shutdown event arrived
    Shutdown,
    /// Every sender is gone
    Closed,
}

/// An event loop over a [`TaskState`]
///
/// Events broadcast on the shared stream are fed to [`TaskState::handle_event`]; if the state
/// asks for a heartbeat, [`TaskState::periodic_task`] runs between events. The loop ends on the
/// shutdown event or when the stream closes, and hands its state back through the join handle.
pub struct Task<S: TaskState> {
    /// Mutated by every event and heartbeat
    state: S,
    /// The shared stream, for events the state emits
    sender: Sender<Arc<S::Event>>,
    /// The shared stream, for events the state consumes
    receiver: Receiver<Arc<S::Event>>,
    /// Identifies the task in logs and handles
    task_id: usize,
}

impl<S: TaskState + Send + 'static> Task<S> {
    /// Wrap a state; nothing runs until [`Task::run`]
    pub fn new(
        state: S,
        sender: Sender<Arc<S::Event>>,
        receiver: Receiver<Arc<S::Event>>,
        task_id: usize,
    ) -> Self {
        Task {
            state,
            sender,
            receiver,
            task_id,
        }
    }

    /// Apply one event from the stream. Returns why the loop should stop, if it should.
    async fn on_input(
        &mut self,
        input: Result<Arc<S::Event>, RecvError>,
    ) -> Option<Exit> {
        match input {
            Ok(event) if *event == S::Event::shutdown_event() => Some(Exit::Shutdown),
            Ok(event) => {
                if let Err(e) = self
                    .state
                    .handle_event(event, &self.sender, &self.receiver)
                    .await
                {
                    info!("Task {} could not handle an event: {e}", self.task_id);
                }
                None
            }
            Err(RecvError::Closed) => Some(Exit::Closed),
            Err(e) => {
                error!("Task {} failed to receive from the event stream: {e}", self.task_id);
                None
            }
        }
    }

    /// Spawn the loop
    pub fn run(mut self) -> TaskHandle<S::Event> {
        let task_id = self.task_id;
        let handle = spawn(async move {
            // a zero period would make `interval` panic
            let mut heartbeat = self.state.period().map(|period| {
                let mut heartbeat = interval(period.max(Duration::from_millis(1)));
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                heartbeat
            });
            let exit = loop {
                tokio::select! {
                    input = self.receiver.recv_direct() => {
                        if let Some(exit) = self.on_input(input).await {
                            break exit;
                        }
                    }
                    () = next_heartbeat(&mut heartbeat) => {
                        self.state.periodic_task(task_id, &self.sender).await;
                    }
                }
            };
            if matches!(exit, Exit::Closed) {
                debug!("Event stream of task {task_id} closed");
            }
            self.state.cancel_subtasks().await;
            Box::new(self.state) as Box<dyn TaskState<Event = S::Event>>
        });
        TaskHandle { handle, task_id }
    }
}

/// Resolve on the next heartbeat tick, or never if the task has no heartbeat
async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// A spawned [`Task`]: its join handle, resolving to the final state, and its id
pub struct TaskHandle<EVENT> {
    /// Resolves once the loop has stopped
    pub handle: JoinHandle<Box<dyn TaskState<Event = EVENT>>>,
    /// Id the task was spawned with
    pub task_id: usize,
}

/// The event-loop tasks of one engine
#[derive(Default)]
pub struct TaskRegistry<EVENT> {
    /// Spawned tasks, in spawn order
    tasks: Vec<TaskHandle<EVENT>>,
}

impl<EVENT: Send + Sync + Clone + TaskEvent> TaskRegistry<EVENT> {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        TaskRegistry { tasks: Vec::new() }
    }

    /// Track a spawned task
    pub fn register(&mut self, handle: TaskHandle<EVENT>) {
        self.tasks.push(handle);
    }

    /// Spawn a task and track it
    pub fn run_task<S>(&mut self, task: Task<S>)
    where
        S: TaskState<Event = EVENT> + Send + 'static,
    {
        self.register(task.run());
    }

    /// Join every task, newest first, and cancel the subtasks of each final state
    ///
    /// The shutdown event must already have been broadcast, otherwise this waits forever.
    pub async fn shutdown(&mut self) {
        while let Some(TaskHandle { handle, task_id }) = self.tasks.pop() {
            match handle.await {
                Ok(mut state) => state.cancel_subtasks().await,
                Err(e) => error!("Task {task_id} did not exit cleanly: {e}"),
            }
        }
    }

    /// Number of tracked tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Transport receive loops
///
/// They block on the transport rather than the event stream, so shutdown aborts them.
#[derive(Default)]
pub struct NetworkTaskRegistry {
    /// Spawned loops
    loops: Vec<JoinHandle<()>>,
}

impl NetworkTaskRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        NetworkTaskRegistry { loops: Vec::new() }
    }

    /// Track a spawned loop
    pub fn register(&mut self, handle: JoinHandle<()>) {
        self.loops.push(handle);
    }

    /// Abort every loop and wait until each has unwound
    pub async fn shutdown(&mut self) {
        let loops = std::mem::take(&mut self.loops);
        for handle in &loops {
            handle.abort();
        }
        for handle in loops {
            match handle.await {
                Err(e) if e.is_panic() => error!("Network task panicked: {e}"),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_broadcast::broadcast;

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    enum TestEvent {
        Shutdown,
        Ping,
    }

    impl TaskEvent for TestEvent {
        fn shutdown_event() -> Self {
            TestEvent::Shutdown
        }
    }

    struct CountingState {
        pings: Arc<AtomicUsize>,
        ticks: Arc<AtomicUsize>,
        cancelled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskState for CountingState {
        type Event = TestEvent;

        fn period(&self) -> Option<Duration> {
            Some(Duration::from_millis(10))
        }

        async fn cancel_subtasks(&mut self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }

        async fn handle_event(
            &mut self,
            event: Arc<TestEvent>,
            _sender: &Sender<Arc<TestEvent>>,
            _receiver: &Receiver<Arc<TestEvent>>,
        ) -> Result<()> {
            if *event == TestEvent::Ping {
                self.pings.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn periodic_task(&mut self, _task_id: usize, _sender: &Sender<Arc<TestEvent>>) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn task_handles_events_ticks_and_shuts_down() {
        let (tx, rx) = broadcast(16);
        let pings = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let state = CountingState {
            pings: Arc::clone(&pings),
            ticks: Arc::clone(&ticks),
            cancelled: Arc::clone(&cancelled),
        };

        let mut registry = TaskRegistry::new();
        registry.run_task(Task::new(state, tx.clone(), rx, 0));

        tx.broadcast(Arc::new(TestEvent::Ping)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.broadcast(Arc::new(TestEvent::Shutdown)).await.unwrap();
        registry.shutdown().await;

        assert_eq!(pings.load(Ordering::SeqCst), 1);
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        // once when the loop exits, once more by the registry
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }
}
