//! Consumer group engine.
//!
//! An `EventConsumer` is one named member of a consumer group on a stream.
//! Group bookkeeping (the delivery cursor and the pending entries) lives in
//! the backend, never in the consumer, so any consumer constructed with the
//! same group resumes where a crashed one left off.
//!
//! Each poll cycle:
//! 1. claims entries that have sat unacknowledged for `claim_idle_timeout`,
//!    whoever they were delivered to;
//! 2. reads never-delivered entries, waiting up to `poll_timeout` only if
//!    nothing was claimed;
//! 3. decodes and dispatches every entry, containing handler errors and
//!    panics per entry;
//! 4. acknowledges finished entries in one call.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, PendingSummary, StoredEntry, StreamBackend};
use crate::config::{EventStoreConfig, FailurePolicy};
use crate::envelope::{EventEnvelope, EventPayload};
use crate::registry::EventRegistry;

mod handler;
mod subscription;

pub use handler::{handler_fn, EventHandler, HandlerError, HandlerResult};
pub use subscription::Subscription;

/// Result type for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors that can occur in consumer operations.
///
/// Decode failures and handler failures are not errors at this level; they
/// show up as `EntryOutcome`s in the `PollReport`.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Consumer is not initialized")]
    NotInitialized,

    #[error("Consumer has been shut down")]
    ShutDown,

    #[error("Backing store did not answer {operation} within {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Stream a consumer reads from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumerTarget {
    /// The global log of every aggregate.
    #[default]
    AllEvents,
    /// One aggregate's stream.
    Aggregate(Uuid),
}

/// What happened to one delivered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Every handler for the event succeeded.
    Handled,
    /// At least one handler returned an error or panicked.
    Failed,
    /// The entry could not be decoded.
    Skipped,
    /// No handler is registered for the event type.
    Ignored,
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Entries taken over from idle pending entries.
    pub claimed: usize,
    /// Never-delivered entries read.
    pub delivered: usize,
    pub handled: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
    /// Failed entries given up on after `max_deliveries`.
    pub abandoned: usize,
    /// Entries acknowledged at the end of the cycle.
    pub acknowledged: u64,
}

impl PollReport {
    /// Entries processed in this cycle.
    pub fn total(&self) -> usize {
        self.claimed + self.delivered
    }

    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Handled => self.handled += 1,
            EntryOutcome::Failed => self.failed += 1,
            EntryOutcome::Skipped => self.skipped += 1,
            EntryOutcome::Ignored => self.ignored += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    ShutDown,
}

struct Handlers<E: EventPayload> {
    by_type: HashMap<String, Arc<dyn EventHandler<E>>>,
    all_events: Vec<Arc<dyn EventHandler<E>>>,
}

impl<E: EventPayload> Default for Handlers<E> {
    fn default() -> Self {
        Self {
            by_type: HashMap::new(),
            all_events: Vec::new(),
        }
    }
}

/// A member of a consumer group.
pub struct EventConsumer<E: EventPayload> {
    backend: Arc<dyn StreamBackend>,
    registry: Arc<EventRegistry<E>>,
    config: EventStoreConfig,
    stream_key: String,
    handlers: RwLock<Handlers<E>>,
    state: RwLock<Lifecycle>,
}

impl<E: EventPayload> EventConsumer<E> {
    /// Create a consumer on the global log.
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        registry: Arc<EventRegistry<E>>,
        config: EventStoreConfig,
    ) -> Self {
        Self::with_target(backend, registry, config, ConsumerTarget::AllEvents)
    }

    /// Create a consumer on a specific stream.
    pub fn with_target(
        backend: Arc<dyn StreamBackend>,
        registry: Arc<EventRegistry<E>>,
        config: EventStoreConfig,
        target: ConsumerTarget,
    ) -> Self {
        let stream_key = match target {
            ConsumerTarget::AllEvents => config.all_events_key(),
            ConsumerTarget::Aggregate(id) => config.stream_key(id),
        };
        Self {
            backend,
            registry,
            config,
            stream_key,
            handlers: RwLock::new(Handlers::default()),
            state: RwLock::new(Lifecycle::Created),
        }
    }

    /// Key of the stream this consumer reads.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Ensure the consumer group exists and start accepting polls.
    ///
    /// Idempotent: an existing group is left as is. Connectivity failures
    /// propagate.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == Lifecycle::ShutDown {
            return Err(ConsumerError::ShutDown);
        }

        if self.config.create_consumer_group_if_not_exists {
            let created = self
                .bounded(
                    "create_group",
                    self.config.operation_timeout(),
                    self.backend.create_group(
                        &self.stream_key,
                        &self.config.consumer_group,
                        self.config.group_start,
                    ),
                )
                .await?;
            debug!(stream = %self.stream_key, created, "Ensured consumer group");
        }

        *state = Lifecycle::Running;
        info!(
            stream = %self.stream_key,
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            "Consumer initialized"
        );
        Ok(())
    }

    /// Stop accepting polls.
    ///
    /// The group and its pending entries stay in the backend for other or
    /// future consumers.
    pub async fn shutdown(&self) {
        *self.state.write().await = Lifecycle::ShutDown;
        info!(consumer = %self.config.consumer_name, "Consumer shut down");
    }

    /// Handle events of `event_type` with `handler`, replacing any handler
    /// already registered for that type.
    pub async fn register_event_handler(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler<E>>,
    ) {
        let event_type = event_type.into();
        let replaced = self
            .handlers
            .write()
            .await
            .by_type
            .insert(event_type.clone(), handler)
            .is_some();
        debug!(%event_type, replaced, "Registered event handler");
    }

    /// Handle every event with `handler`, alongside any type handler.
    pub async fn register_all_events_handler(&self, handler: Arc<dyn EventHandler<E>>) {
        self.handlers.write().await.all_events.push(handler);
        debug!("Registered handler for all events");
    }

    /// Returns whether a handler was registered for `event_type`.
    pub async fn unregister_event_handler(&self, event_type: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .await
            .by_type
            .remove(event_type)
            .is_some();
        debug!(%event_type, removed, "Unregistered event handler");
        removed
    }

    pub async fn unregister_all_events_handlers(&self) {
        self.handlers.write().await.all_events.clear();
        debug!("Unregistered handlers for all events");
    }

    /// Run one poll cycle.
    pub async fn poll_events(&self) -> Result<PollReport> {
        match *self.state.read().await {
            Lifecycle::Created => return Err(ConsumerError::NotInitialized),
            Lifecycle::ShutDown => return Err(ConsumerError::ShutDown),
            Lifecycle::Running => {}
        }

        let group = &self.config.consumer_group;
        let consumer = &self.config.consumer_name;
        let max = self.config.max_batch_size;
        let operation_timeout = self.config.operation_timeout();

        let claimed = self
            .bounded(
                "claim_idle",
                operation_timeout,
                self.backend.claim_idle(
                    &self.stream_key,
                    group,
                    consumer,
                    self.config.claim_idle_timeout(),
                    max,
                ),
            )
            .await?;

        let remaining = max.saturating_sub(claimed.len());
        let block = if claimed.is_empty() {
            self.config.poll_timeout()
        } else {
            Duration::ZERO
        };
        let delivered = if remaining > 0 {
            self.bounded(
                "read_new",
                operation_timeout + block,
                self.backend
                    .read_new(&self.stream_key, group, consumer, remaining, block),
            )
            .await?
        } else {
            Vec::new()
        };

        let mut report = PollReport {
            claimed: claimed.len(),
            delivered: delivered.len(),
            ..PollReport::default()
        };

        let mut finished = Vec::with_capacity(report.total());
        for entry in claimed.iter().chain(delivered.iter()) {
            let outcome = self.process(entry).await;
            report.record(outcome);
            let done = match outcome {
                EntryOutcome::Handled | EntryOutcome::Skipped | EntryOutcome::Ignored => true,
                EntryOutcome::Failed => self.give_up(entry, &mut report),
            };
            if done {
                finished.push(entry.id);
            }
        }

        if !finished.is_empty() {
            report.acknowledged = self
                .bounded(
                    "ack",
                    operation_timeout,
                    self.backend.ack(&self.stream_key, group, &finished),
                )
                .await?;
        }

        if report.total() > 0 {
            debug!(stream = %self.stream_key, consumer = %consumer, ?report, "Polled events");
        }
        Ok(report)
    }

    /// Pending entries of this consumer's group.
    pub async fn pending_summary(&self) -> Result<PendingSummary> {
        self.bounded(
            "pending",
            self.config.operation_timeout(),
            self.backend
                .pending(&self.stream_key, &self.config.consumer_group),
        )
        .await
    }

    async fn process(&self, entry: &StoredEntry) -> EntryOutcome {
        let event = match self.registry.deserialize(&entry.raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    stream = %self.stream_key,
                    entry = %entry.id,
                    event_type = entry.raw.event_type().unwrap_or("<missing>"),
                    error = %e,
                    "Skipping undecodable entry"
                );
                return EntryOutcome::Skipped;
            }
        };

        let handlers: Vec<Arc<dyn EventHandler<E>>> = {
            let handlers = self.handlers.read().await;
            handlers
                .by_type
                .get(&event.event_type)
                .into_iter()
                .chain(handlers.all_events.iter())
                .cloned()
                .collect()
        };

        if handlers.is_empty() {
            debug!(event_type = %event.event_type, entry = %entry.id, "No handler for event");
            return EntryOutcome::Ignored;
        }

        let mut outcome = EntryOutcome::Handled;
        for handler in handlers {
            if let Err(reason) = Self::dispatch(handler.as_ref(), &event).await {
                error!(
                    stream = %self.stream_key,
                    entry = %entry.id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    error = %reason,
                    "Event handler failed"
                );
                outcome = EntryOutcome::Failed;
            }
        }
        outcome
    }

    /// Whether a failed entry should be acknowledged instead of retried.
    fn give_up(&self, entry: &StoredEntry, report: &mut PollReport) -> bool {
        match self.config.handler_failure {
            FailurePolicy::Acknowledge => true,
            FailurePolicy::Retry => {
                let max = self.config.max_deliveries;
                if max == 0 || entry.deliveries < max {
                    return false;
                }
                error!(
                    stream = %self.stream_key,
                    entry = %entry.id,
                    deliveries = entry.deliveries,
                    "Giving up on entry after repeated handler failures"
                );
                report.abandoned += 1;
                true
            }
        }
    }

    /// Run a handler, turning both errors and panics into an error message.
    async fn dispatch(
        handler: &dyn EventHandler<E>,
        event: &EventEnvelope<E>,
    ) -> std::result::Result<(), String> {
        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        after: Duration,
        call: impl Future<Output = std::result::Result<T, BackendError>>,
    ) -> Result<T> {
        match tokio::time::timeout(after, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConsumerError::Timeout { operation, after }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
