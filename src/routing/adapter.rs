//! Adapter registrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::types::{AdapterId, Error, Result};

/// Lifecycle status of an adapter connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    /// Connected, handshake not completed yet
    Starting,
    /// Registered and routable
    Connected,
    /// Missed the handshake deadline
    Timeout,
    /// Transport closed
    Disconnected,
    /// Failed registration or transport error
    Error,
}

impl AdapterStatus {
    pub fn is_routable(self) -> bool {
        self == AdapterStatus::Connected
    }
}

/// Outbound half of an adapter's transport.
///
/// Sends never block: a full queue means the adapter is not keeping up and
/// the frame is refused.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: u64,
    tx: mpsc::Sender<Envelope>,
}

impl ConnectionHandle {
    pub fn new(connection_id: u64, tx: mpsc::Sender<Envelope>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::dispatch_failed(format!(
                "connection {} outbound queue full",
                self.connection_id
            )),
            mpsc::error::TrySendError::Closed(_) => {
                Error::dispatch_failed(format!("connection {} closed", self.connection_id))
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Per-adapter activity counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterMetrics {
    pub total_messages: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
}

/// One live execution channel.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterRegistration {
    pub id: AdapterId,
    pub language: String,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    pub status: AdapterStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub metrics: AdapterMetrics,
    #[serde(skip)]
    pub connection: Option<ConnectionHandle>,
}

impl AdapterRegistration {
    pub fn new(id: AdapterId, language: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            language: language.into(),
            capabilities: Vec::new(),
            runtime: None,
            status: AdapterStatus::Starting,
            registered_at: now,
            last_seen: now,
            metrics: AdapterMetrics::default(),
            connection: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    pub fn with_connection(mut self, connection: ConnectionHandle) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_status(mut self, status: AdapterStatus) -> Self {
        self.status = status;
        self
    }

    /// Keys this adapter is routable under: its language, then each
    /// capability, without duplicates.
    pub fn route_keys(&self) -> Vec<String> {
        let mut keys = vec![self.language.clone()];
        for cap in &self.capabilities {
            if !keys.contains(cap) {
                keys.push(cap.clone());
            }
        }
        keys
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn record(&mut self, success: bool) {
        let now = Utc::now();
        self.metrics.total_messages += 1;
        if !success {
            self.metrics.errors += 1;
        }
        self.metrics.last_active = Some(now);
        self.last_seen = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Intent;
    use serde_json::json;

    #[test]
    fn test_route_keys_dedup() {
        let reg = AdapterRegistration::new(AdapterId::from_string("n1").unwrap(), "javascript")
            .with_capabilities(vec!["javascript".into(), "node".into()]);
        assert_eq!(reg.route_keys(), vec!["javascript", "node"]);
    }

    #[test]
    fn test_record_updates_metrics() {
        let mut reg = AdapterRegistration::new(AdapterId::from_string("n1").unwrap(), "js");
        reg.record(true);
        reg.record(false);
        assert_eq!(reg.metrics.total_messages, 2);
        assert_eq!(reg.metrics.errors, 1);
        assert!(reg.metrics.last_active.is_some());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(AdapterStatus::Timeout).unwrap(), "timeout");
        assert!(AdapterStatus::Connected.is_routable());
        assert!(!AdapterStatus::Starting.is_routable());
    }

    #[tokio::test]
    async fn test_connection_handle_refuses_when_full_or_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(7, tx);
        let env = Envelope::new("kernel", "n1", Intent::Ping, json!({}));

        handle.send(env.clone()).unwrap();
        let err = handle.send(env.clone()).unwrap_err();
        assert!(err.to_string().contains("queue full"));

        assert!(rx.recv().await.is_some());
        drop(rx);
        assert!(handle.is_closed());
        assert!(matches!(handle.send(env), Err(Error::DispatchFailed(_))));
    }
}
