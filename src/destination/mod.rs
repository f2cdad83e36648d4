//! Delivery targets for accepted query results.
//!
//! A destination is chosen by the `kind` string of a stream's
//! [`DestinationConfig`]. The [`DestinationFactory`] validates the
//! configuration while building the client, so a stream with an unusable
//! destination never gets a task.

pub mod webhook;

use async_trait::async_trait;
use bytes::Bytes;
use qstreams_store::DestinationConfig;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use webhook::WebhookDestination;

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("unsupported destination: {0}")]
    Unsupported(String),
    #[error("invalid destination configuration: {0}")]
    Invalid(String),
    #[error("delivery failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("destination returned status {0}")]
    Status(StatusCode),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

impl DestinationError {
    /// Whether retrying on a later tick can ever succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unsupported(_) | Self::Invalid(_))
    }
}

/// A configured delivery target.
#[async_trait]
pub trait Destination: Send + Sync {
    fn kind(&self) -> &str;

    fn validate(&self) -> Result<(), DestinationError>;

    async fn deliver(
        &self,
        payload: Bytes,
        headers: &HashMap<String, String>,
    ) -> Result<(), DestinationError>;
}

/// Builds validated destination clients from configuration.
pub trait DestinationFactory: Send + Sync {
    fn build(&self, config: &DestinationConfig) -> Result<Arc<dyn Destination>, DestinationError>;
}

/// Factory for the HTTP-based destination kinds, sharing one client.
#[derive(Debug, Clone)]
pub struct HttpDestinations {
    client: Client,
    timeout: Duration,
}

impl HttpDestinations {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }
}

impl DestinationFactory for HttpDestinations {
    fn build(&self, config: &DestinationConfig) -> Result<Arc<dyn Destination>, DestinationError> {
        let destination: Arc<dyn Destination> = match config.kind.as_str() {
            webhook::KIND => Arc::new(WebhookDestination::new(
                self.client.clone(),
                &config.url,
                self.timeout,
            )),
            other => return Err(DestinationError::Unsupported(other.to_string())),
        };
        destination.validate()?;
        Ok(destination)
    }
}
