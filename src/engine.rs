//! Control-plane facade over the scheduler, the shared stores and persistence.
//!
//! Every state change goes through the live task when one exists; stored
//! records are only read to (re)create tasks and to report on streams that
//! are not registered.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use qstreams_store::{StateStore, StoreError, StreamMetrics, StreamRecord, StreamSpec, StreamState};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EngineSettings;
use crate::dedupe::DedupeCache;
use crate::destination::{DestinationFactory, HttpDestinations};
use crate::error::EngineError;
use crate::metrics::MetricsAggregator;
use crate::pipeline::Pipeline;
use crate::scheduler::{Scheduler, SchedulerError, Signal};
use crate::source::{HttpQuerySource, QuerySource};
use crate::spec::{new_stream_id, prepare};

/// A stream definition with its effective state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    #[serde(flatten)]
    pub spec: StreamSpec,
    pub state: StreamState,
}

pub struct Engine {
    store: Arc<dyn StateStore>,
    scheduler: Scheduler,
    dedupe: Arc<DedupeCache>,
    metrics: Arc<MetricsAggregator>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn StateStore>,
        source: Arc<dyn QuerySource>,
        destinations: Arc<dyn DestinationFactory>,
    ) -> Self {
        let dedupe = Arc::new(DedupeCache::new());
        let metrics = Arc::new(MetricsAggregator::new());
        let pipeline = Arc::new(Pipeline::new(source, dedupe.clone(), metrics.clone()));
        let scheduler = Scheduler::new(pipeline, destinations, store.clone());
        Self {
            store,
            scheduler,
            dedupe,
            metrics,
        }
    }

    /// Builds an engine talking HTTP to sources and destinations.
    pub fn from_settings(
        settings: &EngineSettings,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, EngineError> {
        let timeout = settings.request_timeout();
        let source = Arc::new(HttpQuerySource::new(timeout)?);
        let destinations = Arc::new(HttpDestinations::new(timeout)?);
        Ok(Self::new(store, source, destinations))
    }

    #[cfg(test)]
    pub(crate) fn dedupe(&self) -> &DedupeCache {
        &self.dedupe
    }

    #[cfg(test)]
    pub(crate) fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// Reloads metrics and restarts every stream that was active before the
    /// last shutdown. Returns the number of streams started.
    pub async fn restore(&self) -> Result<usize, EngineError> {
        let records = self.store.list_streams().await?;

        match self.store.load_all_metrics().await {
            Ok(mut metrics) => {
                let known: HashSet<&str> = records.iter().map(StreamRecord::id).collect();
                metrics.retain(|id, _| known.contains(id.as_str()));
                tracing::info!(streams = metrics.len(), "metrics restored");
                self.metrics.load(metrics).await;
            }
            Err(e) => tracing::error!(error = %e, "failed to load metrics, starting from zero"),
        }

        Ok(self.scheduler.restore_all(records).await)
    }

    /// Validates `spec`, assigns it a fresh id and starts it.
    pub async fn create_and_start(&self, spec: StreamSpec) -> Result<String, EngineError> {
        let mut spec = prepare(spec)?;
        spec.id = new_stream_id();

        let id = spec.id.clone();
        self.save_best_effort(&StreamRecord::new(spec.clone(), StreamState::Creating))
            .await;

        if let Err(e) = self.scheduler.register(spec).await {
            if let Err(discard) = self.store.delete_stream(&id).await {
                tracing::warn!(stream_id = %id, error = %discard, "failed to discard rejected stream");
            }
            return Err(e.into());
        }
        tracing::info!(stream_id = %id, "stream created");
        Ok(id)
    }

    /// Starts a stopped stream.
    pub async fn start(&self, id: &str) -> Result<(), EngineError> {
        if self.scheduler.state(id).await.is_some() {
            match self.scheduler.signal(id, Signal::Resume).await {
                Ok(transition) if transition.applied => return Ok(()),
                Ok(_) => return Err(EngineError::AlreadyRunning(id.to_string())),
                // the task exited in the meantime; register a fresh one below
                Err(SchedulerError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let record = self.load(id).await?;
        self.scheduler.register(record.spec).await?;
        Ok(())
    }

    /// Stops a running stream. Returns once no further tick will run.
    pub async fn stop(&self, id: &str) -> Result<(), EngineError> {
        match self.scheduler.signal(id, Signal::Stop).await {
            Ok(transition) if transition.applied => Ok(()),
            Ok(_) => Err(EngineError::NotRunning(id.to_string())),
            Err(SchedulerError::NotFound(_)) => {
                self.load(id).await?;
                Err(EngineError::NotRunning(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces a stream's definition, keeping its running/stopped state.
    ///
    /// A live task is replaced by one running the new definition, and the
    /// stream's dedupe record is discarded. Counters are kept.
    pub async fn update(&self, id: &str, spec: StreamSpec) -> Result<(), EngineError> {
        let mut spec = prepare(spec)?;
        spec.id = id.to_string();
        self.load(id).await?;
        self.scheduler.destination_for(&spec)?;

        let was_running = self.scheduler.state(id).await == Some(StreamState::Running);
        self.scheduler.unregister(id).await;
        self.dedupe.remove(id).await;

        let state = if was_running {
            StreamState::Running
        } else {
            StreamState::Stopped
        };
        self.store
            .save_stream(&StreamRecord::new(spec.clone(), state))
            .await?;
        if was_running {
            self.scheduler.register(spec).await?;
        }
        tracing::info!(stream_id = %id, %state, "stream updated");
        Ok(())
    }

    /// Stops and removes a stream together with its dedupe and metrics records.
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        self.scheduler.unregister(id).await;
        self.dedupe.remove(id).await;

        if let Err(e) = self.metrics.forget(self.store.as_ref(), id).await {
            tracing::warn!(stream_id = %id, error = %e, "failed to delete metrics record");
        }
        self.store.delete_stream(id).await?;
        tracing::info!(stream_id = %id, "stream deleted");
        Ok(())
    }

    /// Every stored stream with the state of its live task, or `Stopped`
    /// when no task is registered.
    pub async fn list(&self) -> Result<Vec<StreamStatus>, EngineError> {
        let records = self.store.list_streams().await?;
        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            let state = self
                .scheduler
                .state(record.id())
                .await
                .unwrap_or(StreamState::Stopped);
            statuses.push(StreamStatus {
                spec: record.spec,
                state,
            });
        }
        Ok(statuses)
    }

    /// State of the live task for `id`, `None` when none is registered.
    pub async fn status(&self, id: &str) -> Option<StreamState> {
        self.scheduler.state(id).await
    }

    /// Counters for every stream, ordered by id.
    pub async fn metrics_snapshot(&self) -> Vec<(String, StreamMetrics)> {
        let mut snapshot: Vec<_> = self.metrics.snapshot().await.into_iter().collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Starts the periodic metrics flush; it stops when `shutdown` becomes `true`.
    pub fn spawn_metrics_flusher(
        &self,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        self.metrics
            .clone()
            .spawn_flusher(self.store.clone(), interval, shutdown)
    }

    /// Stops every stream task and writes a final metrics snapshot.
    ///
    /// Stored states are left untouched so the same streams resume on the
    /// next start.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.metrics.flush(self.store.as_ref()).await;
    }

    async fn load(&self, id: &str) -> Result<StreamRecord, EngineError> {
        match self.store.load_stream(id).await {
            Ok(record) => Ok(record),
            Err(StoreError::NotFound(_)) => Err(EngineError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_best_effort(&self, record: &StreamRecord) {
        if let Err(e) = self.store.save_stream(record).await {
            tracing::warn!(stream_id = %record.id(), error = %e, "failed to persist stream record");
        }
    }
}
