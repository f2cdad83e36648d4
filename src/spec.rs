//! Validation of stream definitions before they reach the scheduler.

use qstreams_store::StreamSpec;
use thiserror::Error;

/// Smallest accepted dedupe window.
pub const MIN_DEDUPE_WINDOW_MS: u64 = 1_000;
/// Largest accepted dedupe window. Also enforced at suppression time.
pub const MAX_DEDUPE_WINDOW_MS: u64 = 60_000;

/// A stream definition that cannot be run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("source query is required")]
    MissingQuery,
    #[error("source endpoint is required")]
    MissingSourceEndpoint,
    #[error("poll interval must be at least 1ms")]
    ZeroInterval,
    #[error("destination kind is required")]
    MissingDestinationKind,
    #[error("destination url is required")]
    MissingDestinationUrl,
}

/// Checks a definition and returns it ready to run.
///
/// The dedupe window is clamped into
/// [`MIN_DEDUPE_WINDOW_MS`]..=[`MAX_DEDUPE_WINDOW_MS`] when dedupe is enabled;
/// every other problem is rejected.
pub fn prepare(mut spec: StreamSpec) -> Result<StreamSpec, ConfigurationError> {
    if spec.source.query.trim().is_empty() {
        return Err(ConfigurationError::MissingQuery);
    }
    if spec.source.endpoint.trim().is_empty() {
        return Err(ConfigurationError::MissingSourceEndpoint);
    }
    if spec.source.interval_ms == 0 {
        return Err(ConfigurationError::ZeroInterval);
    }
    if spec.destination.kind.trim().is_empty() {
        return Err(ConfigurationError::MissingDestinationKind);
    }
    if spec.destination.url.trim().is_empty() {
        return Err(ConfigurationError::MissingDestinationUrl);
    }

    if spec.dedupe.enabled {
        let clamped = spec
            .dedupe
            .window_ms
            .clamp(MIN_DEDUPE_WINDOW_MS, MAX_DEDUPE_WINDOW_MS);
        if clamped != spec.dedupe.window_ms {
            tracing::info!(
                requested_ms = spec.dedupe.window_ms,
                window_ms = clamped,
                "dedupe window clamped"
            );
            spec.dedupe.window_ms = clamped;
        }
    }

    Ok(spec)
}

/// Generates a fresh stream identifier.
pub fn new_stream_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
