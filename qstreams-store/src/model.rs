//! Persisted record types.
//!
//! A [`StreamSpec`] is the immutable definition of a stream; it is replaced
//! wholesale on update. A [`StreamRecord`] pairs the spec with the lifecycle
//! state the engine last reported for it, which is what survives a restart.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Where and how often to run the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Query text sent to the source
    pub query: String,
    /// Source endpoint the query is posted to
    pub endpoint: String,
    /// Poll interval in milliseconds
    pub interval_ms: u64,
    /// Headers attached to every query request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Where accepted results are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Destination kind, e.g. `"webhook"`
    pub kind: String,
    /// Target endpoint
    pub url: String,
    /// Headers attached to every delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Duplicate suppression policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DedupeConfig {
    pub enabled: bool,
    /// Suppression window in milliseconds
    #[serde(default)]
    pub window_ms: u64,
}

/// Definition of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Opaque identifier, assigned at creation and never reused
    #[serde(default)]
    pub id: String,
    /// Display name
    pub name: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub dedupe: DedupeConfig,
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Submitted,
    Creating,
    Running,
    Stopped,
}

impl StreamState {
    /// Whether a stream last seen in this state should be running after a restart.
    pub fn resumes_on_restore(self) -> bool {
        matches!(self, Self::Submitted | Self::Creating | Self::Running)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "submitted",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A stream definition plus its last known state, as written to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(flatten)]
    pub spec: StreamSpec,
    pub state: StreamState,
}

impl StreamRecord {
    pub fn new(spec: StreamSpec, state: StreamState) -> Self {
        Self { spec, state }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }
}

/// Delivery counters for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Queries attempted against the source
    #[serde(default)]
    pub queries_issued: u64,
    /// Results accepted for delivery
    #[serde(default)]
    pub events_sent: u64,
    /// Results suppressed as duplicates
    #[serde(default)]
    pub events_deduped: u64,
}
