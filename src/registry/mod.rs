//! Event type registry.
//!
//! Maps logical event type names to payload shapes. Each registration holds
//! an encoder and a decoder for one variant of the caller's event enum, so
//! the table is closed: only registered names can be written or read back.
//!
//! The registry is built once at startup and shared behind an `Arc` by the
//! store and every consumer.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::{fields, EventEnvelope, EventPayload, RawEntry};

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while converting between envelopes and entries.
///
/// These are recoverable: the store and consumer turn them into skipped
/// entries rather than failing a read or a poll.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Entry is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Entry field '{field}' is invalid: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Payload does not match registered type '{0}'")]
    TypeMismatch(String),
}

type DecodeFn<E> = Box<dyn Fn(&str) -> serde_json::Result<E> + Send + Sync>;
type EncodeFn<E> = Box<dyn Fn(&E) -> Option<serde_json::Result<String>> + Send + Sync>;

struct Registration<E> {
    decode: DecodeFn<E>,
    encode: EncodeFn<E>,
}

/// Bidirectional table of event type name to payload shape.
pub struct EventRegistry<E> {
    types: HashMap<String, Registration<E>>,
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self {
            types: HashMap::new(),
        }
    }
}

impl<E> fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort_unstable();
        f.debug_struct("EventRegistry")
            .field("types", &names)
            .finish()
    }
}

impl<E: EventPayload> EventRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type under a logical name.
    ///
    /// `wrap` lifts a decoded payload into the event enum; `unwrap` projects
    /// the enum back onto the payload, returning `None` for other variants.
    /// Registering a name twice replaces the earlier mapping.
    pub fn register_event_type<P>(
        &mut self,
        type_name: impl Into<String>,
        wrap: fn(P) -> E,
        unwrap: fn(&E) -> Option<&P>,
    ) -> &mut Self
    where
        P: Serialize + DeserializeOwned + 'static,
    {
        let type_name = type_name.into();
        let registration = Registration {
            decode: Box::new(move |data| serde_json::from_str::<P>(data).map(wrap)),
            encode: Box::new(move |event| unwrap(event).map(serde_json::to_string)),
        };

        if self.types.insert(type_name.clone(), registration).is_some() {
            debug!(event_type = %type_name, "Replaced event type registration");
        } else {
            debug!(event_type = %type_name, "Registered event type");
        }
        self
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn registered_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Serialize an envelope into a stream entry.
    pub fn serialize(&self, event: &EventEnvelope<E>) -> Result<RawEntry> {
        let type_name = event.payload.event_type();
        let registration = self
            .types
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownEventType(type_name.to_string()))?;

        let data = (registration.encode)(&event.payload)
            .ok_or_else(|| RegistryError::TypeMismatch(type_name.to_string()))??;

        let mut raw = RawEntry::new()
            .with(fields::EVENT_TYPE, type_name)
            .with(fields::EVENT_ID, event.event_id.to_string())
            .with(fields::AGGREGATE_ID, event.aggregate_id.to_string())
            .with(fields::VERSION, event.version.to_string())
            .with(fields::TIMESTAMP, event.timestamp.to_rfc3339())
            .with(fields::EVENT_DATA, data);

        if let Some(correlation_id) = &event.correlation_id {
            raw.insert(fields::CORRELATION_ID, correlation_id.as_str());
        }
        if let Some(causation_id) = event.causation_id {
            raw.insert(fields::CAUSATION_ID, causation_id.to_string());
        }

        Ok(raw)
    }

    /// Deserialize a stream entry back into an envelope.
    pub fn deserialize(&self, raw: &RawEntry) -> Result<EventEnvelope<E>> {
        let type_name = required(raw, fields::EVENT_TYPE)?;
        let registration = self
            .types
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownEventType(type_name.to_string()))?;

        let event_id = parse_uuid(raw, fields::EVENT_ID)?;
        let aggregate_id = parse_uuid(raw, fields::AGGREGATE_ID)?;

        let version_str = required(raw, fields::VERSION)?;
        let version = version_str
            .parse::<i64>()
            .map_err(|_| invalid(fields::VERSION, version_str))?;

        let timestamp_str = required(raw, fields::TIMESTAMP)?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp_str)
            .map_err(|_| invalid(fields::TIMESTAMP, timestamp_str))?
            .with_timezone(&Utc);

        let causation_id = match raw.get(fields::CAUSATION_ID) {
            Some(value) => Some(
                Uuid::parse_str(value).map_err(|_| invalid(fields::CAUSATION_ID, value))?,
            ),
            None => None,
        };

        let payload = (registration.decode)(required(raw, fields::EVENT_DATA)?)?;

        Ok(EventEnvelope {
            event_id,
            aggregate_id,
            event_type: type_name.to_string(),
            version,
            timestamp,
            correlation_id: raw.get(fields::CORRELATION_ID).map(str::to_string),
            causation_id,
            payload,
        })
    }
}

fn required<'a>(raw: &'a RawEntry, field: &'static str) -> Result<&'a str> {
    raw.get(field).ok_or(RegistryError::MissingField(field))
}

fn parse_uuid(raw: &RawEntry, field: &'static str) -> Result<Uuid> {
    let value = required(raw, field)?;
    Uuid::parse_str(value).map_err(|_| invalid(field, value))
}

fn invalid(field: &'static str, value: &str) -> RegistryError {
    RegistryError::InvalidField {
        field,
        value: value.to_string(),
    }
}
