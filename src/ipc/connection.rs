//! Per-connection state: adapter identity, bus subscriptions, and the
//! table of dispatches forwarded to the adapter but not yet answered.

use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::commbus::{Message, MessageBus, MessageKind};
use crate::envelope::Envelope;
use crate::routing::ConnectionHandle;
use crate::types::{AdapterId, SubscriptionId, TraceId};

#[derive(Debug)]
struct Forwarded {
    trace_id: TraceId,
    response_topic: String,
    sent_at: Instant,
}

/// Dispatches forwarded to the adapter, keyed by bus correlation id.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    entries: HashMap<String, Forwarded>,
}

impl InFlight {
    pub(crate) fn insert(&mut self, correlation_id: String, trace_id: TraceId, response_topic: String) {
        self.entries.insert(
            correlation_id,
            Forwarded {
                trace_id,
                response_topic,
                sent_at: Instant::now(),
            },
        );
    }

    /// Claim the response topic for an adapter reply, by correlation id
    /// first and by trace id otherwise.
    pub(crate) fn take(&mut self, correlation_id: Option<&str>, trace_id: &TraceId) -> Option<String> {
        if let Some(entry) = correlation_id.and_then(|c| self.entries.remove(c)) {
            return Some(entry.response_topic);
        }
        let key = self
            .entries
            .iter()
            .filter(|(_, f)| &f.trace_id == trace_id)
            .min_by_key(|(_, f)| f.sent_at)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&key).map(|f| f.response_topic)
    }

    pub(crate) fn remove(&mut self, correlation_id: &str) -> bool {
        self.entries.remove(correlation_id).is_some()
    }

    /// Drop entries whose bus request has certainly timed out already.
    pub(crate) fn prune(&mut self, older_than: Duration) {
        let now = Instant::now();
        self.entries
            .retain(|_, f| now.duration_since(f.sent_at) < older_than);
    }

    /// Empty the table, returning every response topic still awaited.
    pub(crate) fn drain(&mut self) -> Vec<String> {
        self.entries.drain().map(|(_, f)| f.response_topic).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State owned by one connection's reader loop.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub(crate) id: u64,
    pub(crate) peer: SocketAddr,
    pub(crate) opened_at: Instant,
    pub(crate) handle: ConnectionHandle,
    /// Set once a `register` succeeds on this connection.
    pub(crate) adapter: Option<AdapterId>,
    pub(crate) subscriptions: Vec<SubscriptionId>,
    pub(crate) in_flight: Arc<Mutex<InFlight>>,
}

impl ConnectionState {
    pub(crate) fn new(id: u64, peer: SocketAddr, handle: ConnectionHandle) -> Self {
        Self {
            id,
            peer,
            opened_at: Instant::now(),
            handle,
            adapter: None,
            subscriptions: Vec::new(),
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    pub(crate) fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        lock(&self.in_flight)
    }
}

fn lock(m: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bus handler that forwards execute requests to the adapter behind
/// `handle`, stamping the bus correlation id into `meta.correlation_id`.
///
/// A request that cannot be forwarded fails its caller immediately instead
/// of waiting out the request timeout.
pub(crate) fn forward_requests(
    bus: MessageBus,
    handle: ConnectionHandle,
    in_flight: Arc<Mutex<InFlight>>,
    request_timeout: Duration,
) -> impl Fn(&Message) + Send + Sync + 'static {
    move |message: &Message| {
        if message.kind != MessageKind::Request {
            return;
        }
        let Some(response_topic) = message.metadata.response_topic.clone() else {
            return;
        };
        let correlation_id = message
            .metadata
            .request_id
            .clone()
            .unwrap_or_else(|| message.id.clone());

        let envelope = match serde_json::from_value::<Envelope>(message.payload.clone()) {
            Ok(envelope) => envelope.with_correlation_id(correlation_id.clone()),
            Err(e) => {
                bus.publish_message(Message::response(
                    response_topic,
                    Value::Null,
                    Some(format!("undeliverable envelope: {e}")),
                ));
                return;
            }
        };

        {
            let mut table = lock(&in_flight);
            table.prune(request_timeout);
            table.insert(
                correlation_id.clone(),
                envelope.trace_id().clone(),
                response_topic.clone(),
            );
        }

        if let Err(e) = handle.send(envelope) {
            lock(&in_flight).remove(&correlation_id);
            tracing::warn!(
                connection_id = handle.connection_id(),
                error = %e,
                "could not forward dispatch"
            );
            bus.publish_message(Message::response(response_topic, Value::Null, Some(e.to_string())));
        }
    }
}
