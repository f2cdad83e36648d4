//! Query execution against the source system.

use async_trait::async_trait;
use bytes::Bytes;
use qstreams_store::SourceConfig;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("source returned status {0}")]
    Status(StatusCode),
    #[error("source request timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs a stream's query and returns the raw result body.
#[async_trait]
pub trait QuerySource: Send + Sync {
    async fn fetch(&self, source: &SourceConfig) -> Result<Bytes, SourceError>;
}

/// Posts `{"sql": <query>}` to the configured endpoint.
#[derive(Debug, Clone)]
pub struct HttpQuerySource {
    client: Client,
    timeout: Duration,
}

impl HttpQuerySource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl QuerySource for HttpQuerySource {
    async fn fetch(&self, source: &SourceConfig) -> Result<Bytes, SourceError> {
        let mut request = self
            .client
            .post(&source.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({ "sql": source.query }));
        for (name, value) in &source.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout(self.timeout)
            } else {
                SourceError::Transport(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout(self.timeout)
            } else {
                SourceError::Transport(e)
            }
        })
    }
}
