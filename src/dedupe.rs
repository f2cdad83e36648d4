//! Content-based duplicate suppression.
//!
//! One record per stream: the fingerprint of the last accepted payload and
//! when it was accepted. Memory use therefore grows with the number of
//! streams, not with payload volume.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::spec::MAX_DEDUPE_WINDOW_MS;

/// Upper bound applied to every suppression window.
pub const MAX_WINDOW: Duration = Duration::from_millis(MAX_DEDUPE_WINDOW_MS);

#[derive(Debug, Clone)]
struct DedupeRecord {
    fingerprint: String,
    accepted_at: Instant,
}

/// Last accepted fingerprint per stream.
#[derive(Debug, Default)]
pub struct DedupeCache {
    records: Mutex<HashMap<String, DedupeRecord>>,
}

impl DedupeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hex-encoded SHA-256 of a payload.
    pub fn fingerprint(payload: &[u8]) -> String {
        hex::encode(Sha256::digest(payload))
    }

    /// Decides whether `fingerprint` is a duplicate for `stream_id` at `now`.
    ///
    /// Returns `true` when the stream's last accepted fingerprint is identical
    /// and was accepted no more than `window` ago. Otherwise the payload is
    /// accepted: the stored record is replaced and `false` is returned.
    pub async fn should_suppress(
        &self,
        stream_id: &str,
        fingerprint: &str,
        window: Duration,
        now: Instant,
    ) -> bool {
        let window = window.min(MAX_WINDOW);
        let mut records = self.records.lock().await;

        if let Some(record) = records.get(stream_id) {
            if record.fingerprint == fingerprint
                && now.saturating_duration_since(record.accepted_at) <= window
            {
                return true;
            }
        }

        records.insert(
            stream_id.to_string(),
            DedupeRecord {
                fingerprint: fingerprint.to_string(),
                accepted_at: now,
            },
        );
        false
    }

    /// Forgets the record for a stream.
    pub async fn remove(&self, stream_id: &str) {
        self.records.lock().await.remove(stream_id);
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, stream_id: &str) -> bool {
        self.records.lock().await.contains_key(stream_id)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}
