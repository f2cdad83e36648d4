//! In-memory storage backend.

use crate::model::{StreamMetrics, StreamRecord};
use crate::storage::{StateStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Store that keeps every record in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    streams: Mutex<HashMap<String, StreamRecord>>,
    metrics: Mutex<HashMap<String, StreamMetrics>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with the given stream records.
    pub fn with_streams(records: impl IntoIterator<Item = StreamRecord>) -> Self {
        let streams = records
            .into_iter()
            .map(|record| (record.spec.id.clone(), record))
            .collect();
        Self {
            streams: Mutex::new(streams),
            metrics: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_stream(&self, id: &str) -> Result<StreamRecord, StoreError> {
        self.streams
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save_stream(&self, record: &StreamRecord) -> Result<(), StoreError> {
        self.streams
            .lock()
            .await
            .insert(record.spec.id.clone(), record.clone());
        Ok(())
    }

    async fn list_streams(&self) -> Result<Vec<StreamRecord>, StoreError> {
        let mut records: Vec<_> = self.streams.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        Ok(records)
    }

    async fn delete_stream(&self, id: &str) -> Result<(), StoreError> {
        self.streams.lock().await.remove(id);
        Ok(())
    }

    async fn load_all_metrics(&self) -> Result<HashMap<String, StreamMetrics>, StoreError> {
        Ok(self.metrics.lock().await.clone())
    }

    async fn save_all_metrics(
        &self,
        metrics: &HashMap<String, StreamMetrics>,
    ) -> Result<(), StoreError> {
        let mut stored = self.metrics.lock().await;
        for (id, record) in metrics {
            stored.insert(id.clone(), *record);
        }
        Ok(())
    }

    async fn delete_metrics(&self, id: &str) -> Result<(), StoreError> {
        self.metrics.lock().await.remove(id);
        Ok(())
    }
}
