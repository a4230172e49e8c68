//! Event Store - event sourcing storage and consumer groups
//!
//! Per-aggregate append-only streams with optimistic concurrency, a global
//! log of every event, and consumer groups with at-least-once delivery and
//! crash recovery, over an in-memory or Redis Streams backend.

pub mod backend;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod registry;
pub mod store;
pub mod utils;


pub use backend::{init_backend, BackendError, MemoryBackend, StreamBackend};
pub use config::{ConfigError, EventStoreConfig, FailurePolicy};
pub use consumer::{
    handler_fn, ConsumerError, ConsumerTarget, EntryOutcome, EventConsumer, EventHandler,
    HandlerResult, PollReport, Subscription,
};
pub use envelope::{EventEnvelope, EventPayload, NewEvent, RawEntry, NO_STREAM};
pub use registry::{EventRegistry, RegistryError};
pub use store::{EventStore, StoreError};
