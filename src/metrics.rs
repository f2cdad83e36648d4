//! Per-stream delivery counters and their periodic persistence.

use qstreams_store::{StateStore, StoreError, StreamMetrics};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Counter selector for [`MetricsAggregator::increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricField {
    QueriesIssued,
    EventsSent,
    EventsDeduped,
}

/// Per-stream delivery counters shared by every stream task.
///
/// Flushing and [`forget`](Self::forget) are serialized, so a snapshot taken
/// before a stream is forgotten is never written after its stored record
/// has been deleted.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    records: Mutex<HashMap<String, StreamMetrics>>,
    persist: Mutex<()>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment(&self, stream_id: &str, field: MetricField) {
        let mut records = self.records.lock().await;
        let record = records.entry(stream_id.to_string()).or_default();
        match field {
            MetricField::QueriesIssued => record.queries_issued += 1,
            MetricField::EventsSent => record.events_sent += 1,
            MetricField::EventsDeduped => record.events_deduped += 1,
        }
    }

    pub async fn get(&self, stream_id: &str) -> Option<StreamMetrics> {
        self.records.lock().await.get(stream_id).copied()
    }

    /// Deep copy of every record; the lock is held only for the copy.
    pub async fn snapshot(&self) -> HashMap<String, StreamMetrics> {
        self.records.lock().await.clone()
    }

    pub async fn remove(&self, stream_id: &str) -> Option<StreamMetrics> {
        self.records.lock().await.remove(stream_id)
    }

    /// Replaces every record, used once at startup.
    pub async fn load(&self, records: HashMap<String, StreamMetrics>) {
        *self.records.lock().await = records;
    }

    /// Drops the counters for a stream and deletes its stored record.
    pub async fn forget(&self, store: &dyn StateStore, stream_id: &str) -> Result<(), StoreError> {
        let _persist = self.persist.lock().await;
        self.remove(stream_id).await;
        store.delete_metrics(stream_id).await
    }

    /// Writes the current snapshot to the store, logging instead of failing.
    pub async fn flush(&self, store: &dyn StateStore) -> bool {
        let _persist = self.persist.lock().await;
        let snapshot = self.snapshot().await;
        match store.save_all_metrics(&snapshot).await {
            Ok(()) => {
                tracing::debug!(streams = snapshot.len(), "metrics flushed");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to flush metrics");
                false
            }
        }
    }

    /// Spawns the periodic flusher.
    ///
    /// The task flushes every `interval` until `shutdown` flips to `true` (or
    /// its sender is dropped), then flushes one final time.
    pub fn spawn_flusher(
        self: Arc<Self>,
        store: Arc<dyn StateStore>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.flush(store.as_ref()).await;
                    }
                }
            }

            self.flush(store.as_ref()).await;
            tracing::info!("metrics flusher stopped");
        })
    }
}
