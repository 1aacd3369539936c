//! Communication bus for pub/sub and request/response patterns.
//!
//! Every component of the kernel talks through this bus:
//!   - adapters receive dispatched tasks on their private execute topic
//!   - replies come back on per-request private response topics
//!   - kernel lifecycle events are published for observers
//!
//! Patterns supported:
//!   - **Events**: synchronous fan-out to every subscriber, in registration order
//!   - **Requests**: publish a request-typed message and await the one reply
//!     on a private `response:{id}` topic, with a deadline
//!   - **Responders**: at most one async handler per topic that answers requests
//!
//! Locks are std locks held only for map lookups; handlers always run after
//! the lock is released, so a handler may publish or subscribe re-entrantly.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::types::{CorrelationId, Error, Result, SubscriptionId, TraceId};

/// Topic that receives every published message.
pub const WILDCARD: &str = "*";

const RESPONSE_PREFIX: &str = "response:";

// =============================================================================
// Message Types
// =============================================================================

/// Kind of bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Event,
    Request,
    Response,
}

/// Routing metadata carried alongside a message payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_topic: Option<String>,

    /// Set on responses that carry a failure instead of a result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMetadata {
    pub fn traced(trace_id: TraceId) -> Self {
        Self {
            trace_id: Some(trace_id),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        kind: MessageKind,
        payload: Value,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            kind,
            timestamp: Utc::now(),
            payload,
            metadata,
        }
    }

    pub fn event(topic: impl Into<String>, payload: Value) -> Self {
        Self::new(topic, MessageKind::Event, payload, MessageMetadata::default())
    }

    /// Reply for a pending request. `error` fails the waiting call.
    pub fn response(topic: impl Into<String>, payload: Value, error: Option<String>) -> Self {
        let metadata = MessageMetadata {
            error,
            ..MessageMetadata::default()
        };
        Self::new(topic, MessageKind::Response, payload, metadata)
    }
}

/// Synchronous subscriber callback.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Designated async responder for a topic.
pub type Responder = Arc<dyn Fn(Value, MessageMetadata) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

// =============================================================================
// Statistics
// =============================================================================

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub events_published: u64,
    pub requests_issued: u64,
    pub requests_resolved: u64,
    pub requests_timed_out: u64,
    pub late_responses_dropped: u64,
    pub active_subscribers: usize,
    pub registered_handlers: usize,
    pub pending_requests: usize,
}

// =============================================================================
// MessageBus
// =============================================================================

struct Subscriber {
    id: SubscriptionId,
    topic: String,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    /// Kept in registration order across all topics.
    subscribers: RwLock<Vec<Subscriber>>,

    /// Designated responders: topic -> responder.
    responders: RwLock<HashMap<String, Responder>>,

    /// Pending requests: private response topic -> waiting caller.
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,

    stats: Mutex<BusStats>,
}

/// In-process message bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    /// Register a handler for `topic` (or [`WILDCARD`]). Stays active until
    /// [`unsubscribe`](Self::unsubscribe) is called with the returned id.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let topic = topic.into();
        tracing::debug!(topic = %topic, subscription = %id, "subscribed");

        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subs.push(Subscriber {
            id: id.clone(),
            topic,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| &s.id != id);
        before != subs.len()
    }

    /// Publish an event to every subscriber of `topic`, then return the
    /// number of handlers invoked.
    pub fn publish(&self, topic: &str, payload: Value, metadata: MessageMetadata) -> usize {
        self.publish_message(Message::new(topic, MessageKind::Event, payload, metadata))
    }

    /// Deliver a fully built message.
    ///
    /// A message on a pending response topic resolves that request first.
    /// Subscribers then run synchronously in registration order. A request
    /// on a topic with a responder additionally spawns the responder.
    pub fn publish_message(&self, message: Message) -> usize {
        lock(&self.inner.stats).events_published += 1;

        if message.topic.starts_with(RESPONSE_PREFIX) {
            self.resolve_pending(&message);
        }

        let handlers: Vec<Handler> = {
            let subs = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subs.iter()
                .filter(|s| s.topic == message.topic || s.topic == WILDCARD)
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in &handlers {
            handler(&message);
        }

        if message.kind == MessageKind::Request {
            self.spawn_responder(&message);
        }

        handlers.len()
    }

    fn resolve_pending(&self, message: &Message) {
        let waiter = lock(&self.inner.pending).remove(&message.topic);
        let delivered = match waiter {
            Some(tx) => tx.send(message.clone()).is_ok(),
            None => false,
        };
        if !delivered {
            lock(&self.inner.stats).late_responses_dropped += 1;
            tracing::debug!(topic = %message.topic, "dropping late response");
        }
    }

    // =========================================================================
    // Request/Response
    // =========================================================================

    /// Install the single responder for `topic`.
    pub fn handle<F>(&self, topic: impl Into<String>, responder: F) -> Result<()>
    where
        F: Fn(Value, MessageMetadata) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let mut responders = self
            .inner
            .responders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if responders.contains_key(&topic) {
            return Err(Error::configuration(format!(
                "responder already registered for topic '{topic}'"
            )));
        }
        tracing::debug!(topic = %topic, "registered responder");
        responders.insert(topic, Arc::new(responder));
        Ok(())
    }

    /// Remove the responder for `topic`.
    pub fn unhandle(&self, topic: &str) -> bool {
        self.inner
            .responders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .is_some()
    }

    fn spawn_responder(&self, message: &Message) {
        let responder = self
            .inner
            .responders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.topic)
            .cloned();
        let Some(responder) = responder else {
            return;
        };
        let Some(reply_to) = message.metadata.response_topic.clone() else {
            tracing::warn!(topic = %message.topic, "request without response topic");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(topic = %message.topic, "no runtime to run responder");
            self.publish_message(Message::response(
                reply_to,
                Value::Null,
                Some("responder unavailable".to_string()),
            ));
            return;
        };

        let bus = self.clone();
        let future = responder(message.payload.clone(), message.metadata.clone());
        runtime.spawn(async move {
            let reply = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(value)) => Message::response(reply_to, value, None),
                Ok(Err(e)) => Message::response(reply_to, Value::Null, Some(e.to_string())),
                Err(_) => Message::response(
                    reply_to,
                    Value::Null,
                    Some("responder panicked".to_string()),
                ),
            };
            bus.publish_message(reply);
        });
    }

    /// Issue a request on `topic` and wait up to `timeout` for its reply.
    pub async fn request(&self, topic: &str, payload: Value, timeout: Duration) -> Result<Value> {
        self.request_with(topic, payload, MessageMetadata::default(), timeout)
            .await
    }

    /// Like [`request`](Self::request), with caller-provided metadata.
    ///
    /// Resolves at most once: the pending entry is removed on reply, on
    /// timeout, or when the returned future is dropped.
    pub async fn request_with(
        &self,
        topic: &str,
        payload: Value,
        mut metadata: MessageMetadata,
        timeout: Duration,
    ) -> Result<Value> {
        let correlation = CorrelationId::new();
        let reply_topic = correlation.response_topic();
        let (tx, rx) = oneshot::channel();

        lock(&self.inner.pending).insert(reply_topic.clone(), tx);
        let _guard = PendingGuard {
            inner: self.inner.as_ref(),
            topic: reply_topic.clone(),
        };
        lock(&self.inner.stats).requests_issued += 1;

        metadata.request_id = Some(correlation.to_string());
        metadata.response_topic = Some(reply_topic);
        self.publish_message(Message::new(topic, MessageKind::Request, payload, metadata));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                lock(&self.inner.stats).requests_resolved += 1;
                match reply.metadata.error {
                    Some(error) => Err(Error::dispatch_failed(error)),
                    None => Ok(reply.payload),
                }
            }
            Ok(Err(_)) => Err(Error::internal(format!(
                "response channel closed for '{topic}'"
            ))),
            Err(_) => {
                lock(&self.inner.stats).requests_timed_out += 1;
                tracing::debug!(topic = %topic, ?timeout, "request timed out");
                Err(Error::timeout(format!(
                    "no response on '{topic}' within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Get current bus statistics.
    pub fn stats(&self) -> BusStats {
        let mut stats = lock(&self.inner.stats).clone();
        stats.active_subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        stats.registered_handlers = self
            .inner
            .responders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        stats.pending_requests = lock(&self.inner.pending).len();
        stats
    }
}

/// Removes a pending request entry however the waiting future ends.
struct PendingGuard<'a> {
    inner: &'a BusInner,
    topic: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.topic);
    }
}

// =============================================================================
// Tests
// =============================================================================
