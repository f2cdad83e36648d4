//! Stream scheduler and worker registry.
//!
//! The registry owns one task per live stream and is the only place runtime
//! state changes. Control-plane requests never edit a stored record to stop
//! or resume a stream; they send a [`Signal`] to the registered task, the task
//! applies it to itself, persists the new state as a recovery snapshot and
//! acknowledges.
//!
//! A task is in one of two modes:
//! - `Running`: ticking at the stream's poll interval
//! - `Stopped`: registered but idle, waiting for `Resume` or removal
//!
//! Dropping a task's command sender (see [`Scheduler::unregister`]) makes it
//! exit after any in-flight tick, without touching the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use qstreams_store::{StateStore, StreamRecord, StreamSpec, StreamState};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::destination::{Destination, DestinationError, DestinationFactory};
use crate::pipeline::{Pipeline, TickOutcome};

/// Lifecycle command delivered to a live task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Stop,
    Resume,
}

/// Result of a signal as applied by the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Whether the signal changed the task's state.
    pub applied: bool,
    /// State after the signal was handled.
    pub state: StreamState,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("stream {0} already has a live task")]
    AlreadyRunning(String),
    #[error("stream {0} has no live task")]
    NotFound(String),
    #[error("destination rejected for stream {id}: {source}")]
    Destination {
        id: String,
        #[source]
        source: DestinationError,
    },
}

struct Command {
    signal: Signal,
    ack: oneshot::Sender<Transition>,
}

struct TaskHandle {
    generation: u64,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<StreamState>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    fn is_live(&self) -> bool {
        !self.join.is_finished()
    }
}

type TaskMap = Mutex<HashMap<String, TaskHandle>>;

/// Registry of per-stream polling tasks.
pub struct Scheduler {
    tasks: Arc<TaskMap>,
    generations: AtomicU64,
    pipeline: Arc<Pipeline>,
    destinations: Arc<dyn DestinationFactory>,
    store: Arc<dyn StateStore>,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        destinations: Arc<dyn DestinationFactory>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            pipeline,
            destinations,
            store,
        }
    }

    /// Builds and validates the destination for a stream without registering it.
    pub fn destination_for(&self, spec: &StreamSpec) -> Result<Arc<dyn Destination>, SchedulerError> {
        self.destinations
            .build(&spec.destination)
            .map_err(|source| SchedulerError::Destination {
                id: spec.id.clone(),
                source,
            })
    }

    /// Starts a running task for `spec`.
    ///
    /// Fails with `AlreadyRunning` if a live task exists for the stream, or
    /// with `Destination` if the destination does not validate; in both cases
    /// nothing is registered.
    pub async fn register(&self, spec: StreamSpec) -> Result<(), SchedulerError> {
        let destination = self.destination_for(&spec)?;
        let id = spec.id.clone();

        let mut tasks = self.tasks.lock().await;
        if tasks.get(&id).is_some_and(TaskHandle::is_live) {
            return Err(SchedulerError::AlreadyRunning(id));
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(StreamState::Running);
        let worker = StreamTask {
            spec,
            generation,
            destination,
            pipeline: self.pipeline.clone(),
            store: self.store.clone(),
            registry: Arc::downgrade(&self.tasks),
            state: state_tx,
        };
        let join = tokio::spawn(worker.run(commands_rx));

        tasks.insert(
            id.clone(),
            TaskHandle {
                generation,
                commands: commands_tx,
                state: state_rx,
                join,
            },
        );
        tracing::info!(stream_id = %id, "stream task registered");
        Ok(())
    }

    /// Sends `signal` to the live task for `id` and waits for it to be applied.
    ///
    /// A task only reads signals between ticks, so the returned transition
    /// also means any in-flight tick has completed.
    pub async fn signal(&self, id: &str, signal: Signal) -> Result<Transition, SchedulerError> {
        let commands = {
            let tasks = self.tasks.lock().await;
            match tasks.get(id) {
                Some(handle) if handle.is_live() => handle.commands.clone(),
                _ => return Err(SchedulerError::NotFound(id.to_string())),
            }
        };

        let (ack, acked) = oneshot::channel();
        commands
            .send(Command { signal, ack })
            .await
            .map_err(|_| SchedulerError::NotFound(id.to_string()))?;
        acked
            .await
            .map_err(|_| SchedulerError::NotFound(id.to_string()))
    }

    /// Current state of the live task for `id`, if any.
    pub async fn state(&self, id: &str) -> Option<StreamState> {
        let tasks = self.tasks.lock().await;
        tasks
            .get(id)
            .filter(|handle| handle.is_live())
            .map(|handle| *handle.state.borrow())
    }

    /// Ids of every live task.
    pub async fn ids(&self) -> Vec<String> {
        let tasks = self.tasks.lock().await;
        let mut ids: Vec<_> = tasks
            .iter()
            .filter(|(_, handle)| handle.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stops and forgets the task for `id`, waiting for it to exit.
    ///
    /// Returns whether a task was registered. Calling it again is a no-op.
    pub async fn unregister(&self, id: &str) -> bool {
        let handle = self.tasks.lock().await.remove(id);
        match handle {
            Some(handle) => {
                finish(id, handle).await;
                tracing::info!(stream_id = %id, "stream task unregistered");
                true
            }
            None => false,
        }
    }

    /// Registers every record whose last state should resume after a restart.
    ///
    /// Returns the number of tasks started. Records that fail to register are
    /// logged and skipped.
    pub async fn restore_all(&self, records: Vec<StreamRecord>) -> usize {
        tracing::info!(count = records.len(), "restoring streams");
        let mut started = 0;
        for record in records {
            let id = record.spec.id.clone();
            if !record.state.resumes_on_restore() {
                tracing::info!(stream_id = %id, state = %record.state, "stream left inactive");
                continue;
            }
            match self.register(record.spec).await {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(stream_id = %id, error = %e, "failed to restore stream"),
            }
        }
        tracing::info!(started, "stream restoration completed");
        started
    }

    /// Stops every task and waits for all of them to exit.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.tasks.lock().await.drain().collect();
        join_all(drained.into_iter().map(|(id, handle)| async move {
            finish(&id, handle).await;
        }))
        .await;
    }
}

async fn finish(id: &str, handle: TaskHandle) {
    let TaskHandle { commands, join, .. } = handle;
    drop(commands);
    if let Err(e) = join.await {
        tracing::error!(stream_id = %id, error = %e, "stream task ended abnormally");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// State owned by one running stream task.
struct StreamTask {
    spec: StreamSpec,
    generation: u64,
    destination: Arc<dyn Destination>,
    pipeline: Arc<Pipeline>,
    store: Arc<dyn StateStore>,
    registry: Weak<TaskMap>,
    state: watch::Sender<StreamState>,
}

impl StreamTask {
    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        let id = self.spec.id.clone();
        let period = Duration::from_millis(self.spec.source.interval_ms.max(1));
        self.persist(StreamState::Running).await;
        tracing::info!(stream_id = %id, name = %self.spec.name, interval = ?period, "stream running");

        let mut ticks = ticker(period);
        loop {
            let running = *self.state.borrow() == StreamState::Running;
            if !running {
                match commands.recv().await {
                    Some(command) => {
                        if self.apply(command).await == StreamState::Running {
                            ticks = ticker(period);
                        }
                    }
                    None => break,
                }
                continue;
            }

            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => {
                        self.apply(command).await;
                    }
                    None => break,
                },
                _ = ticks.tick() => {
                    match self.pipeline.run_tick(&self.spec, self.destination.as_ref()).await {
                        Ok(TickOutcome::Delivered) | Ok(TickOutcome::Suppressed) => {}
                        Ok(outcome) => {
                            tracing::debug!(stream_id = %id, ?outcome, "tick finished without delivery");
                        }
                        Err(e) => {
                            tracing::error!(stream_id = %id, error = %e, "stream task terminating");
                            self.release().await;
                            return;
                        }
                    }
                }
            }
        }
        tracing::info!(stream_id = %id, "stream task exited");
    }

    async fn apply(&self, command: Command) -> StreamState {
        let current = *self.state.borrow();
        let target = match command.signal {
            Signal::Stop => StreamState::Stopped,
            Signal::Resume => StreamState::Running,
        };
        let applied = current != target;
        if applied {
            self.state.send_replace(target);
            self.persist(target).await;
            tracing::info!(stream_id = %self.spec.id, from = %current, to = %target, "stream state changed");
        }

        let state = *self.state.borrow();
        // the requester may have given up waiting
        let _ = command.ack.send(Transition { applied, state });
        state
    }

    async fn persist(&self, state: StreamState) {
        let record = StreamRecord::new(self.spec.clone(), state);
        if let Err(e) = self.store.save_stream(&record).await {
            tracing::warn!(stream_id = %self.spec.id, %state, error = %e, "failed to persist stream state");
        }
    }

    /// Removes this task's registry entry, unless a newer registration replaced it.
    async fn release(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut tasks = registry.lock().await;
        if tasks
            .get(&self.spec.id)
            .is_some_and(|handle| handle.generation == self.generation)
        {
            tasks.remove(&self.spec.id);
        }
    }
}
