//! Storage backends for stream records and metrics snapshots.
//!
//! This module provides two backend implementations:
//! - `file`: JSON documents on the local filesystem
//! - `memory`: in-process maps, lost on exit
//!
//! Each backend implements the `StateStore` trait. The engine treats the
//! store as a snapshot for crash recovery only; the live scheduler remains
//! the source of truth for a running stream.

pub mod file;
pub mod memory;

use crate::model::{StreamMetrics, StreamRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Errors returned by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence interface consumed by the engine.
///
/// Records are opaque blobs keyed by stream id. Implementations must be safe
/// to call concurrently; the engine issues saves from every stream task and
/// from the metrics flusher.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Load one stream record.
    async fn load_stream(&self, id: &str) -> Result<StreamRecord, StoreError>;

    /// Insert or replace a stream record.
    async fn save_stream(&self, record: &StreamRecord) -> Result<(), StoreError>;

    /// List every readable stream record.
    async fn list_streams(&self) -> Result<Vec<StreamRecord>, StoreError>;

    /// Remove a stream record. Removing a missing record is not an error.
    async fn delete_stream(&self, id: &str) -> Result<(), StoreError>;

    /// Load every persisted metrics record keyed by stream id.
    async fn load_all_metrics(&self) -> Result<HashMap<String, StreamMetrics>, StoreError>;

    /// Persist a full metrics snapshot.
    async fn save_all_metrics(
        &self,
        metrics: &HashMap<String, StreamMetrics>,
    ) -> Result<(), StoreError>;

    /// Remove the metrics record for one stream. Missing records are ignored.
    async fn delete_metrics(&self, id: &str) -> Result<(), StoreError>;
}
