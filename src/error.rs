//! Errors returned by the control-plane operations of [`Engine`](crate::Engine).

use qstreams_store::StoreError;
use thiserror::Error;

use crate::destination::DestinationError;
use crate::scheduler::SchedulerError;
use crate::spec::ConfigurationError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid stream configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("invalid destination: {0}")]
    Destination(#[from] DestinationError),
    #[error("stream {0} is already running")]
    AlreadyRunning(String),
    #[error("stream not found: {0}")]
    NotFound(String),
    #[error("stream {0} is not running")]
    NotRunning(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl From<SchedulerError> for EngineError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::AlreadyRunning(id) => Self::AlreadyRunning(id),
            SchedulerError::NotFound(id) => Self::NotFound(id),
            SchedulerError::Destination { source, .. } => Self::Destination(source),
        }
    }
}
