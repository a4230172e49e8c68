//! Shared utilities for integration tests.
//!
//! A small order-handling domain and helpers to build stores and consumers
//! over one shared in-memory backend.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use event_store::{
    handler_fn, EventConsumer, EventEnvelope, EventHandler, EventPayload, EventRegistry,
    EventStore, EventStoreConfig, MemoryBackend, StreamBackend,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub customer: String,
    pub total_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub carrier: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    Placed(OrderPlaced),
    Shipped(OrderShipped),
    Cancelled(OrderCancelled),
}

impl EventPayload for OrderEvent {
    fn event_type(&self) -> &str {
        match self {
            OrderEvent::Placed(_) => "OrderPlaced",
            OrderEvent::Shipped(_) => "OrderShipped",
            OrderEvent::Cancelled(_) => "OrderCancelled",
        }
    }
}

pub fn placed(customer: &str, total_cents: u64) -> OrderEvent {
    OrderEvent::Placed(OrderPlaced {
        customer: customer.to_string(),
        total_cents,
    })
}

pub fn shipped(carrier: &str) -> OrderEvent {
    OrderEvent::Shipped(OrderShipped {
        carrier: carrier.to_string(),
    })
}

pub fn cancelled(reason: &str) -> OrderEvent {
    OrderEvent::Cancelled(OrderCancelled {
        reason: reason.to_string(),
    })
}

/// Registry with every order event registered.
pub fn order_registry() -> EventRegistry<OrderEvent> {
    let mut registry = EventRegistry::new();
    registry
        .register_event_type("OrderPlaced", OrderEvent::Placed, |e| match e {
            OrderEvent::Placed(p) => Some(p),
            _ => None,
        })
        .register_event_type("OrderShipped", OrderEvent::Shipped, |e| match e {
            OrderEvent::Shipped(p) => Some(p),
            _ => None,
        })
        .register_event_type("OrderCancelled", OrderEvent::Cancelled, |e| match e {
            OrderEvent::Cancelled(p) => Some(p),
            _ => None,
        });
    registry
}

pub fn test_config() -> EventStoreConfig {
    EventStoreConfig {
        stream_prefix: "orders:".to_string(),
        consumer_group: "order-projections".to_string(),
        consumer_name: "projector-1".to_string(),
        poll_timeout_ms: 10,
        ..EventStoreConfig::default()
    }
}

/// A store and any number of consumers sharing one backend.
pub struct Harness {
    pub backend: Arc<dyn StreamBackend>,
    pub registry: Arc<EventRegistry<OrderEvent>>,
    pub store: EventStore<OrderEvent>,
}

impl Harness {
    pub fn new() -> Self {
        event_store::utils::bootstrap::try_init_tracing();

        let backend: Arc<dyn StreamBackend> = Arc::new(MemoryBackend::new());
        let registry = Arc::new(order_registry());
        let store = EventStore::new(backend.clone(), registry.clone(), test_config());
        Self {
            backend,
            registry,
            store,
        }
    }

    pub fn consumer(&self, group: &str, name: &str) -> EventConsumer<OrderEvent> {
        self.consumer_with(EventStoreConfig {
            consumer_group: group.to_string(),
            consumer_name: name.to_string(),
            ..test_config()
        })
    }

    pub fn consumer_with(&self, config: EventStoreConfig) -> EventConsumer<OrderEvent> {
        EventConsumer::new(self.backend.clone(), self.registry.clone(), config)
    }
}

/// Handler that records the event ids it receives.
pub fn recording_handler() -> (Arc<dyn EventHandler<OrderEvent>>, Arc<Mutex<Vec<Uuid>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let handler = handler_fn(move |event: &EventEnvelope<OrderEvent>| {
        log.lock().unwrap().push(event.event_id);
        Ok(())
    });
    (handler, seen)
}
