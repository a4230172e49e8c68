//! Event envelopes and their wire representation.
//!
//! `NewEvent` is what a caller hands to the store: everything about the event
//! except its version. The store assigns versions at append time and hands
//! back `EventEnvelope`s on reads. `RawEntry` is the flat string map that
//! actually lives in a stream entry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Version of a stream that has no events yet.
///
/// Passing this as the expected version asserts the stream must not exist.
pub const NO_STREAM: i64 = -1;

/// Field names of a stream entry.
pub mod fields {
    pub const EVENT_TYPE: &str = "eventType";
    pub const EVENT_ID: &str = "eventId";
    pub const AGGREGATE_ID: &str = "aggregateId";
    pub const VERSION: &str = "version";
    pub const TIMESTAMP: &str = "timestamp";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const CAUSATION_ID: &str = "causationId";
    pub const EVENT_DATA: &str = "eventData";
}

/// A domain event payload.
///
/// Usually implemented on a tagged enum with one variant per event type.
/// The returned name is the registry key for the variant.
pub trait EventPayload: Send + Sync + 'static {
    /// Logical event type name used for registry lookup.
    fn event_type(&self) -> &str;
}

/// An event that has not been appended yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent<E> {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<Uuid>,
    pub payload: E,
}

impl<E> NewEvent<E> {
    /// Create an event for an aggregate with a fresh id and the current time.
    pub fn new(aggregate_id: Uuid, payload: E) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Mark this event as caused by `cause`.
    ///
    /// Inherits the cause's correlation id (or starts a correlation at the
    /// cause's event id) and records the cause as the causation id.
    pub fn caused_by<P>(mut self, cause: &EventEnvelope<P>) -> Self {
        self.correlation_id = Some(
            cause
                .correlation_id
                .clone()
                .unwrap_or_else(|| cause.event_id.to_string()),
        );
        self.causation_id = Some(cause.event_id);
        self
    }
}

impl<E: EventPayload> NewEvent<E> {
    /// Stamp the event with the version assigned by the store.
    pub(crate) fn into_envelope(self, version: i64) -> EventEnvelope<E> {
        EventEnvelope {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            event_type: self.payload.event_type().to_string(),
            version,
            timestamp: self.timestamp,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload: self.payload,
        }
    }
}

/// A committed event: a payload plus its metadata and stream position.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<E> {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    /// Position within the aggregate's stream, starting at 0.
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<Uuid>,
    pub payload: E,
}

/// Raw stream entry: the serialized form of an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    fields: BTreeMap<String, String>,
}

impl RawEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Event type of the entry, if present.
    pub fn event_type(&self) -> Option<&str> {
        self.get(fields::EVENT_TYPE)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawEntry {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
