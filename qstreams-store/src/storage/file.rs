//! Filesystem storage backend.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/streams/<id>.json   stream record (spec + last known state)
//! <root>/metrics/<id>.json   metrics counters
//! ```
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! crash mid-write leaves the previous document intact. Unreadable documents
//! are skipped with a warning when listing.

use crate::model::{StreamMetrics, StreamRecord};
use crate::storage::{StateStore, StoreError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const STREAMS_DIR: &str = "streams";
const METRICS_DIR: &str = "metrics";
const EXTENSION: &str = "json";

/// JSON-file backed store.
#[derive(Debug, Clone)]
pub struct FileStore {
    streams_dir: PathBuf,
    metrics_dir: PathBuf,
}

impl FileStore {
    /// Opens a store rooted at `root`, creating the directory layout if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let store = Self {
            streams_dir: root.join(STREAMS_DIR),
            metrics_dir: root.join(METRICS_DIR),
        };
        fs::create_dir_all(&store.streams_dir).await?;
        fs::create_dir_all(&store.metrics_dir).await?;
        Ok(store)
    }

    fn stream_path(&self, id: &str) -> PathBuf {
        self.streams_dir.join(format!("{id}.{EXTENSION}"))
    }

    fn metrics_path(&self, id: &str) -> PathBuf {
        self.metrics_dir.join(format!("{id}.{EXTENSION}"))
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Returns `(stem, path)` for every `*.json` file in `dir`.
async fn json_documents(dir: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(dir).await?;
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut documents = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            documents.push((stem.to_string(), path.clone()));
        }
    }
    Ok(documents)
}

#[async_trait]
impl StateStore for FileStore {
    async fn load_stream(&self, id: &str) -> Result<StreamRecord, StoreError> {
        match read_json(&self.stream_path(id)).await {
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            other => other,
        }
    }

    async fn save_stream(&self, record: &StreamRecord) -> Result<(), StoreError> {
        write_json(&self.stream_path(record.id()), record).await
    }

    async fn list_streams(&self) -> Result<Vec<StreamRecord>, StoreError> {
        let mut records = Vec::new();
        for (_, path) in json_documents(&self.streams_dir).await? {
            match read_json::<StreamRecord>(&path).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable stream record");
                }
            }
        }
        records.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        Ok(records)
    }

    async fn delete_stream(&self, id: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.stream_path(id)).await
    }

    async fn load_all_metrics(&self) -> Result<HashMap<String, StreamMetrics>, StoreError> {
        let mut metrics = HashMap::new();
        for (id, path) in json_documents(&self.metrics_dir).await? {
            match read_json::<StreamMetrics>(&path).await {
                Ok(record) => {
                    metrics.insert(id, record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable metrics record");
                }
            }
        }
        Ok(metrics)
    }

    async fn save_all_metrics(
        &self,
        metrics: &HashMap<String, StreamMetrics>,
    ) -> Result<(), StoreError> {
        for (id, record) in metrics {
            write_json(&self.metrics_path(id), record).await?;
        }
        Ok(())
    }

    async fn delete_metrics(&self, id: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.metrics_path(id)).await
    }
}
