//! Event handler trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{EventEnvelope, EventPayload};

/// Error returned by a handler. Logged by the consumer, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for event handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Callback invoked for each delivered event.
///
/// Delivery is at-least-once: an event can reach a handler again after a
/// consumer crash or a failed attempt, so handlers should be idempotent.
#[async_trait]
pub trait EventHandler<E: EventPayload>: Send + Sync {
    async fn handle(&self, event: &EventEnvelope<E>) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<E, F> EventHandler<E> for FnHandler<F>
where
    E: EventPayload,
    F: Fn(&EventEnvelope<E>) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, event: &EventEnvelope<E>) -> HandlerResult {
        (self.0)(event)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<E, F>(f: F) -> Arc<dyn EventHandler<E>>
where
    E: EventPayload,
    F: Fn(&EventEnvelope<E>) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}
