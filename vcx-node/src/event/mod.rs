//! Events Service
//!
//! In-memory publish/subscribe hub. Registries publish one event for every
//! successful mutation, modules publish message and problem events, and
//! end-developer code subscribes to observe what the framework does.
//!
//! Delivery is fire-and-forget to the listeners registered at publish time:
//! there is no buffering and no replay. A failing or panicking listener is
//! logged and counted but never affects other listeners or the publisher.

pub mod logger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{error, trace};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    MessageSent,
    MessageReceived,
    ProblemReported,
}

/// Which part of the framework it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTopic {
    Did,
    Connection,
    Mediator,
    Messaging,
    Transport,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => write!(f, "created"),
            EventKind::Updated => write!(f, "updated"),
            EventKind::Deleted => write!(f, "deleted"),
            EventKind::MessageSent => write!(f, "message_sent"),
            EventKind::MessageReceived => write!(f, "message_received"),
            EventKind::ProblemReported => write!(f, "problem_reported"),
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTopic::Did => write!(f, "did"),
            EventTopic::Connection => write!(f, "connection"),
            EventTopic::Mediator => write!(f, "mediator"),
            EventTopic::Messaging => write!(f, "messaging"),
            EventTopic::Transport => write!(f, "transport"),
        }
    }
}

/// An immutable framework event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub topic: EventTopic,
    /// Id of the record or message the event is about.
    pub source_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, topic: EventTopic, source_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            topic,
            source_id: source_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Error type returned by listeners. Listener code is end-developer code,
/// so any error is accepted.
pub type ListenerError = anyhow::Error;

/// Event listener trait for receiving framework events
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Handle an event. Errors are logged by the bus and go nowhere else.
    async fn handle_event(&self, event: &Event) -> Result<(), ListenerError>;
}

/// Adapts a synchronous closure into an [`EventListener`].
pub struct FnListener<F>(F);

impl<F> FnListener<F>
where
    F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F> EventListener for FnListener<F>
where
    F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync,
{
    async fn handle_event(&self, event: &Event) -> Result<(), ListenerError> {
        (self.0)(event)
    }
}

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone)]
struct Subscription {
    handle: SubscriptionHandle,
    predicate: Predicate,
    listener: Arc<dyn EventListener>,
}

/// Event bus for publishing and subscribing to framework events
pub struct EventBus {
    /// Sender for stream-style consumers
    sender: broadcast::Sender<Event>,
    /// Listener table in registration order
    subscriptions: RwLock<Vec<Subscription>>,
    next_handle: AtomicU64,
    failures: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("listener_failures", &self.listener_failures())
            .finish()
    }
}

impl EventBus {
    /// Create a new event bus. `channel_capacity` bounds the broadcast
    /// channel; slow channel receivers lag, they never block publish.
    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            subscriptions: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            failures: AtomicU64::new(0),
        }
    }

    /// Register `listener` for events matching `predicate`.
    pub fn subscribe<P>(&self, predicate: P, listener: Arc<dyn EventListener>) -> SubscriptionHandle
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        subscriptions.push(Subscription {
            handle,
            predicate: Arc::new(predicate),
            listener,
        });
        trace!("Registered listener {}", handle);
        handle
    }

    /// Register `listener` for every event.
    pub fn subscribe_all(&self, listener: Arc<dyn EventListener>) -> SubscriptionHandle {
        self.subscribe(|_| true, listener)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        let before = subscriptions.len();
        subscriptions.retain(|s| s.handle != handle);
        before != subscriptions.len()
    }

    /// Get a receiver for all events published from now on
    pub fn subscribe_channel(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Number of listener invocations that returned an error or panicked.
    pub fn listener_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver `event` to every matching listener, in registration order.
    pub async fn publish(&self, event: Event) {
        // No receivers is fine
        let _ = self.sender.send(event.clone());

        // The lock is released before any listener runs, so listeners may
        // subscribe or unsubscribe without deadlocking.
        let snapshot: Vec<Subscription> = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| (s.predicate)(&event))
            .cloned()
            .collect();

        for subscription in snapshot {
            let outcome = AssertUnwindSafe(subscription.listener.handle_event(&event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Listener {} failed on event {} ({} {}): {:#}",
                        subscription.handle, event.id, event.topic, event.kind, err
                    );
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Listener {} panicked on event {} ({} {})",
                        subscription.handle, event.id, event.topic, event.kind
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Arc<dyn EventListener>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |name: &'static str| -> Arc<dyn EventListener> {
            let log = log_clone.clone();
            FnListener::new(move |e: &Event| {
                log.lock().unwrap().push(format!("{}:{}", name, e.source_id));
                Ok(())
            })
        };
        (log, make)
    }

    fn event(source: &str) -> Event {
        Event::new(EventKind::Created, EventTopic::Connection, source, json!({}))
    }

    #[tokio::test]
    async fn test_delivery_in_registration_order() {
        let bus = EventBus::default();
        let (log, make) = recorder();
        bus.subscribe_all(make("a"));
        bus.subscribe_all(make("b"));

        bus.publish(event("c1")).await;
        assert_eq!(*log.lock().unwrap(), vec!["a:c1", "b:c1"]);
    }

    #[tokio::test]
    async fn test_predicate_and_unsubscribe() {
        let bus = EventBus::default();
        let (log, make) = recorder();
        let handle = bus.subscribe(|e| e.topic == EventTopic::Mediator, make("m"));

        bus.publish(event("c1")).await;
        bus.publish(Event::new(EventKind::Updated, EventTopic::Mediator, "m1", json!({}))).await;
        assert_eq!(*log.lock().unwrap(), vec!["m:m1"]);

        assert!(bus.unsubscribe(handle));
        assert!(!bus.unsubscribe(handle));
        bus.publish(Event::new(EventKind::Updated, EventTopic::Mediator, "m2", json!({}))).await;
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_listeners_are_contained() {
        let bus = EventBus::default();
        let (log, make) = recorder();
        bus.subscribe_all(FnListener::new(|_| Err(anyhow::anyhow!("boom"))));
        bus.subscribe_all(FnListener::new(|_| panic!("listener panic")));
        bus.subscribe_all(make("after"));

        bus.publish(event("c1")).await;
        assert_eq!(*log.lock().unwrap(), vec!["after:c1"]);
        assert_eq!(bus.listener_failures(), 2);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = EventBus::default();
        bus.publish(event("early")).await;

        let (log, make) = recorder();
        bus.subscribe_all(make("late"));
        let mut rx = bus.subscribe_channel();
        bus.publish(event("c2")).await;

        assert_eq!(*log.lock().unwrap(), vec!["late:c2"]);
        assert_eq!(rx.recv().await.unwrap().source_id, "c2");
    }
}
