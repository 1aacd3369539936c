//! Bus-backed dispatcher.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::commbus::{MessageBus, MessageMetadata};
use crate::envelope::Envelope;
use crate::resilience::Dispatcher;
use crate::types::{AdapterId, Result};

/// Dispatches by issuing a bus request on the adapter's private execute
/// topic. Whoever holds the adapter's connection subscribes to that topic
/// and publishes the adapter's reply back on the request's response topic.
#[derive(Debug, Clone)]
pub struct BusDispatcher {
    bus: MessageBus,
    timeout: Duration,
}

impl BusDispatcher {
    pub fn new(bus: MessageBus, timeout: Duration) -> Self {
        Self { bus, timeout }
    }
}

#[async_trait]
impl Dispatcher for BusDispatcher {
    async fn dispatch(&self, adapter_id: &AdapterId, envelope: &Envelope) -> Result<Value> {
        let payload = envelope.to_value()?;
        let metadata = MessageMetadata::traced(envelope.trace_id().clone());
        self.bus
            .request_with(&adapter_id.execute_topic(), payload, metadata, self.timeout)
            .await
    }
}
