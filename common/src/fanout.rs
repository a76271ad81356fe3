// Notification and cache-invalidation fan-out
//
// Sinks are synchronous and must not block: the dispatch action calls them
// after its persistence steps and moves on immediately.

use crate::models::CollectionTag;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives user-facing transient notices
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str);
}

/// Marks cached collections as stale
#[cfg_attr(test, mockall::automock)]
pub trait InvalidationSink: Send + Sync {
    fn invalidate(&self, tag: CollectionTag);
}

/// Event published on the bus for UI layers and other observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    Notice { message: String },
    Invalidated { tag: CollectionTag },
}

/// Broadcast bus implementing both sinks
///
/// Sending never blocks. With no subscribers the event is dropped, and slow
/// subscribers observe a lag instead of holding the sender back.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: DispatchEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event subscribers; event dropped");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for EventBus {
    fn notify(&self, message: &str) {
        self.publish(DispatchEvent::Notice {
            message: message.to_string(),
        });
    }
}

impl InvalidationSink for EventBus {
    fn invalidate(&self, tag: CollectionTag) {
        self.publish(DispatchEvent::Invalidated { tag });
    }
}

/// The pair of sinks the dispatch action signals after a successful dispatch
#[derive(Clone)]
pub struct FanOut {
    notifier: Arc<dyn NotificationSink>,
    invalidator: Arc<dyn InvalidationSink>,
}

impl FanOut {
    pub fn new(notifier: Arc<dyn NotificationSink>, invalidator: Arc<dyn InvalidationSink>) -> Self {
        Self {
            notifier,
            invalidator,
        }
    }

    /// Route both notices and invalidations through one bus
    pub fn from_bus(bus: Arc<EventBus>) -> Self {
        Self::new(bus.clone(), bus)
    }

    pub fn notify(&self, message: &str) {
        self.notifier.notify(message);
    }

    pub fn invalidate_all(&self, tags: &[CollectionTag]) {
        for tag in tags {
            self.invalidator.invalidate(*tag);
        }
    }
}

/// Log every bus event until the bus is dropped
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(DispatchEvent::Notice { message }) => {
                    info!(notice = %message, "Dispatch notice");
                }
                Ok(DispatchEvent::Invalidated { tag }) => {
                    debug!(tag = %tag, "Collection invalidated");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
