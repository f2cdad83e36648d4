//! The poll-dedupe-deliver pipeline run on every tick of a stream.
//!
//! Each step is isolated: a failed fetch ends the tick before dedupe or
//! delivery state is touched, and a failed delivery never rolls back the
//! dedupe decision. Counters are updated on every path so that the metrics
//! always describe what was attempted.

use std::sync::Arc;
use std::time::Duration;

use qstreams_store::StreamSpec;
use thiserror::Error;
use tokio::time::Instant;

use crate::dedupe::DedupeCache;
use crate::destination::{Destination, DestinationError};
use crate::metrics::{MetricField, MetricsAggregator};
use crate::source::QuerySource;

/// What happened during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The query failed; nothing else ran.
    FetchFailed,
    /// The result matched the last accepted one inside the window.
    Suppressed,
    /// The result was accepted and delivered.
    Delivered,
    /// The result was accepted but delivery failed.
    DeliveryFailed,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("destination for stream {stream_id} is no longer usable: {source}")]
    Fatal {
        stream_id: String,
        #[source]
        source: DestinationError,
    },
}

/// Shared, stateless driver for stream ticks.
///
/// The only state it touches lives in the injected dedupe cache and metrics
/// aggregator; no lock is held across a network call.
pub struct Pipeline {
    source: Arc<dyn QuerySource>,
    dedupe: Arc<DedupeCache>,
    metrics: Arc<MetricsAggregator>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn QuerySource>,
        dedupe: Arc<DedupeCache>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            source,
            dedupe,
            metrics,
        }
    }

    #[cfg(test)]
    pub(crate) fn dedupe(&self) -> &DedupeCache {
        &self.dedupe
    }

    #[cfg(test)]
    pub(crate) fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// Runs a single tick for `spec`, delivering through `destination`.
    pub async fn run_tick(
        &self,
        spec: &StreamSpec,
        destination: &dyn Destination,
    ) -> Result<TickOutcome, PipelineError> {
        let stream_id = spec.id.as_str();

        self.metrics
            .increment(stream_id, MetricField::QueriesIssued)
            .await;
        let payload = match self.source.fetch(&spec.source).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(stream_id, name = %spec.name, error = %e, "query failed");
                return Ok(TickOutcome::FetchFailed);
            }
        };

        if spec.dedupe.enabled {
            let fingerprint = DedupeCache::fingerprint(&payload);
            let window = Duration::from_millis(spec.dedupe.window_ms);
            if self
                .dedupe
                .should_suppress(stream_id, &fingerprint, window, Instant::now())
                .await
            {
                self.metrics
                    .increment(stream_id, MetricField::EventsDeduped)
                    .await;
                tracing::debug!(stream_id, "duplicate result suppressed");
                return Ok(TickOutcome::Suppressed);
            }
        }

        self.metrics
            .increment(stream_id, MetricField::EventsSent)
            .await;
        match destination
            .deliver(payload, &spec.destination.headers)
            .await
        {
            Ok(()) => {
                tracing::debug!(stream_id, destination = destination.kind(), "result delivered");
                Ok(TickOutcome::Delivered)
            }
            Err(e) if e.is_fatal() => Err(PipelineError::Fatal {
                stream_id: stream_id.to_string(),
                source: e,
            }),
            Err(e) => {
                tracing::warn!(stream_id, name = %spec.name, error = %e, "delivery failed");
                Ok(TickOutcome::DeliveryFailed)
            }
        }
    }
}
