//! qstreams: recurring query streams with duplicate suppression
//!
//! A stream periodically runs a query against a source endpoint, optionally
//! drops results identical to the last accepted one within a time window,
//! and forwards everything else to a destination such as a webhook.
//!
//! Every live stream is driven by its own task, owned by the
//! [`Scheduler`]. The [`Engine`] exposes the control-plane operations
//! (create, start, stop, update, delete, metrics) and routes every state
//! change through the live task rather than through stored records.
//!
//! # Example
//!
//! ```rust,no_run
//! use qstreams::{Engine, EngineSettings};
//! use qstreams_store::{
//!     DedupeConfig, DestinationConfig, FileStore, SourceConfig, StreamSpec,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(FileStore::open("./data").await?);
//!     let settings = EngineSettings {
//!         request_timeout_ms: 10_000,
//!         metrics_flush_secs: 30,
//!     };
//!     let engine = Engine::from_settings(&settings, store)?;
//!     engine.restore().await?;
//!
//!     let id = engine
//!         .create_and_start(StreamSpec {
//!             id: String::new(),
//!             name: "failed logins".to_string(),
//!             source: SourceConfig {
//!                 query: "SELECT count(*) FROM logins WHERE ok = false".to_string(),
//!                 endpoint: "http://broker:8099/query/sql".to_string(),
//!                 interval_ms: 5_000,
//!                 headers: HashMap::new(),
//!             },
//!             destination: DestinationConfig {
//!                 kind: "webhook".to_string(),
//!                 url: "https://hooks.example.com/logins".to_string(),
//!                 headers: HashMap::new(),
//!             },
//!             dedupe: DedupeConfig {
//!                 enabled: true,
//!                 window_ms: 30_000,
//!             },
//!         })
//!         .await?;
//!
//!     engine.stop(&id).await?;
//!     for (stream_id, counters) in engine.metrics_snapshot().await {
//!         println!("{stream_id}: {counters:?}");
//!     }
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dedupe;
pub mod destination;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod source;
pub mod spec;

#[cfg(test)]
mod tests;

pub use config::{CliArgs, EngineSettings, Settings};
pub use dedupe::DedupeCache;
pub use destination::{Destination, DestinationError, DestinationFactory, HttpDestinations};
pub use engine::{Engine, StreamStatus};
pub use error::EngineError;
pub use metrics::{MetricField, MetricsAggregator};
pub use pipeline::{Pipeline, PipelineError, TickOutcome};
pub use scheduler::{Scheduler, SchedulerError, Signal, Transition};
pub use source::{HttpQuerySource, QuerySource, SourceError};
pub use spec::ConfigurationError;
