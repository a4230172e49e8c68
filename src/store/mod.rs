//! Stream storage engine.
//!
//! Appends events to per-aggregate streams under optimistic concurrency and
//! mirrors every accepted event into the global log. Reads decode entries
//! through the registry and skip any entry that fails to decode, so one
//! poisoned entry never blocks access to the rest of a stream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, StoredEntry, StreamBackend};
use crate::config::EventStoreConfig;
use crate::envelope::{EventEnvelope, EventPayload, NewEvent, NO_STREAM};
use crate::registry::{EventRegistry, RegistryError};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream moved on since the caller read it. Nothing was written;
    /// re-read the stream and retry against `actual`.
    #[error("Concurrency conflict on aggregate {aggregate_id}: expected version {expected}, actual {actual}")]
    Concurrency {
        aggregate_id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("Event for aggregate {actual} appended to stream of aggregate {expected}")]
    AggregateMismatch { expected: Uuid, actual: Uuid },

    #[error("Invalid expected version: {0}")]
    InvalidVersion(i64),

    #[error("Backing store did not answer {operation} within {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Event store over a stream backend.
///
/// Cheap to clone; clones share the backend and registry.
pub struct EventStore<E> {
    backend: Arc<dyn StreamBackend>,
    registry: Arc<EventRegistry<E>>,
    config: EventStoreConfig,
}

impl<E> Clone for EventStore<E> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

impl<E: EventPayload> EventStore<E> {
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        registry: Arc<EventRegistry<E>>,
        config: EventStoreConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StreamBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<EventRegistry<E>> {
        &self.registry
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    /// Append a single event to its aggregate's stream.
    ///
    /// Returns the version assigned to the event.
    pub async fn append_event(&self, event: NewEvent<E>, expected_version: i64) -> Result<i64> {
        let aggregate_id = event.aggregate_id;
        self.append_to_stream(aggregate_id, vec![event], expected_version)
            .await
    }

    /// Append a batch of events to an aggregate's stream.
    ///
    /// Succeeds only if the stream is currently at `expected_version`
    /// (`NO_STREAM` for a stream that must not exist yet). The events get
    /// contiguous versions from `expected_version + 1` and are mirrored to
    /// the global log in the same atomic write. Returns the last assigned
    /// version; an empty batch writes nothing and returns the current one.
    pub async fn append_to_stream(
        &self,
        aggregate_id: Uuid,
        events: Vec<NewEvent<E>>,
        expected_version: i64,
    ) -> Result<i64> {
        if expected_version < NO_STREAM {
            return Err(StoreError::InvalidVersion(expected_version));
        }
        if events.is_empty() {
            return self.get_stream_version(aggregate_id).await;
        }

        let mut entries = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            if event.aggregate_id != aggregate_id {
                return Err(StoreError::AggregateMismatch {
                    expected: aggregate_id,
                    actual: event.aggregate_id,
                });
            }
            let envelope = event.into_envelope(expected_version + 1 + offset as i64);
            entries.push(self.registry.serialize(&envelope)?);
        }

        let stream_key = self.config.stream_key(aggregate_id);
        let global_key = self.config.all_events_key();
        let count = entries.len();

        let result = self
            .bounded(
                "append",
                self.backend
                    .append(&stream_key, &global_key, expected_version, entries),
            )
            .await;

        match result {
            Ok(version) => {
                info!(%aggregate_id, count, version, "Appended events");
                Ok(version)
            }
            Err(StoreError::Backend(BackendError::VersionMismatch { actual })) => {
                warn!(
                    %aggregate_id,
                    expected = expected_version,
                    actual,
                    "Version conflict on append"
                );
                Err(StoreError::Concurrency {
                    aggregate_id,
                    expected: expected_version,
                    actual,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Read an aggregate's events with `from_version <= version <= to_version`.
    ///
    /// `None` reads to the end of the stream. Undecodable entries are
    /// skipped and logged.
    pub async fn read_from_stream(
        &self,
        aggregate_id: Uuid,
        from_version: i64,
        to_version: Option<i64>,
    ) -> Result<Vec<EventEnvelope<E>>> {
        let from = from_version.max(0) as u64;
        let to = match to_version {
            Some(to) if to < from as i64 => return Ok(Vec::new()),
            Some(to) => Some(to as u64),
            None => None,
        };

        let key = self.config.stream_key(aggregate_id);
        let entries = self
            .bounded("read_from_stream", self.backend.range(&key, from, to))
            .await?;

        Ok(self.decode_all(&key, entries))
    }

    /// Read up to `max_count` events from the global log starting at
    /// `from_position`, across all aggregates.
    ///
    /// Positions index the decodable events of the global log in append
    /// order; undecodable entries are skipped and take no position, so the
    /// next page starts at `from_position + page.len()`. `None` or
    /// `Some(0)` reads to the end.
    pub async fn read_all_events(
        &self,
        from_position: u64,
        max_count: Option<usize>,
    ) -> Result<Vec<EventEnvelope<E>>> {
        let limit = match max_count {
            Some(max) if max > 0 => max,
            _ => usize::MAX,
        };

        let key = self.config.all_events_key();
        let entries = self
            .bounded("read_all_events", self.backend.range(&key, 0, None))
            .await?;

        Ok(self
            .decode_all(&key, entries)
            .into_iter()
            .skip(usize::try_from(from_position).unwrap_or(usize::MAX))
            .take(limit)
            .collect())
    }

    /// Current version of an aggregate's stream, or `NO_STREAM` if it has
    /// no events.
    pub async fn get_stream_version(&self, aggregate_id: Uuid) -> Result<i64> {
        let key = self.config.stream_key(aggregate_id);
        let len = self
            .bounded("get_stream_version", self.backend.stream_len(&key))
            .await?;
        Ok(len as i64 - 1)
    }

    fn decode_all(&self, key: &str, entries: Vec<StoredEntry>) -> Vec<EventEnvelope<E>> {
        let total = entries.len();
        let events: Vec<_> = entries
            .into_iter()
            .filter_map(|entry| match self.registry.deserialize(&entry.raw) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(
                        stream = %key,
                        entry = %entry.id,
                        event_type = entry.raw.event_type().unwrap_or("<missing>"),
                        error = %e,
                        "Skipping undecodable entry"
                    );
                    None
                }
            })
            .collect();

        debug!(stream = %key, read = total, decoded = events.len(), "Read entries");
        events
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = std::result::Result<T, BackendError>>,
    ) -> Result<T> {
        let after = self.config.operation_timeout();
        match tokio::time::timeout(after, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout { operation, after }),
        }
    }
}
