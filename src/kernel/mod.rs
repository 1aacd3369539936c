//! Kernel - the routing context every surface talks to.
//!
//! The Kernel owns the message bus, routing table, policy gate and breaker
//! map, and is shared as `Arc<Kernel>` by the connection server and the HTTP
//! surface. Subsystems are plain structs behind short-lived locks, not
//! separate actors.
//!
//! Task flow: validate → policy → resolve → built-in call or resilient
//! dispatch → result.

mod dispatcher;
mod recovery;

pub use dispatcher::BusDispatcher;
pub use recovery::with_recovery;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::commbus::{BusStats, Message, MessageBus, MessageMetadata, WILDCARD};
use crate::envelope::{self, Envelope, Intent};
use crate::policy::PolicyGate;
use crate::resilience::{BreakerSnapshot, Dispatcher, ResilienceWrapper};
use crate::routing::{
    AdapterRegistration, AdapterSelector, AdapterStatus, ConnectionHandle, RandomSelector, Route,
    RoutingStats, RoutingTable,
};
use crate::services::BuiltinService;
use crate::types::{AdapterId, Config, Error, Result};

/// Bus topics the kernel publishes lifecycle events on.
pub mod topics {
    pub const ADAPTER_REGISTERED: &str = "kernel.adapter.registered";
    pub const ADAPTER_DISCONNECTED: &str = "kernel.adapter.disconnected";
    pub const TASK_COMPLETED: &str = "kernel.task.completed";
    pub const TASK_FAILED: &str = "kernel.task.failed";
}

/// Task outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub completed: u64,
    pub failed: u64,
}

/// Everything `/health` and the `stats` control action report.
#[derive(Debug, Clone, Serialize)]
pub struct KernelHealth {
    pub status: &'static str,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub selector: &'static str,
    pub adapters: Vec<AdapterRegistration>,
    pub routing: RoutingStats,
    pub bus: BusStats,
    pub breakers: BTreeMap<String, BreakerSnapshot>,
    pub tasks: TaskStats,
}

/// Routing kernel context.
pub struct Kernel {
    config: Config,
    bus: MessageBus,
    routing: RwLock<RoutingTable>,
    policy: PolicyGate,
    resilience: ResilienceWrapper,
    selector: Box<dyn AdapterSelector>,
    dispatcher: Arc<dyn Dispatcher>,
    started_at: DateTime<Utc>,
    started: Instant,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("bus", &self.bus)
            .field("selector", &self.selector)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Build a kernel whose adapter dispatch goes over its own bus.
    pub fn new(config: Config) -> Self {
        let bus = MessageBus::new();
        let dispatcher = Arc::new(BusDispatcher::new(
            bus.clone(),
            config.dispatch.request_timeout,
        ));

        bus.subscribe(WILDCARD, |m: &Message| {
            tracing::trace!(
                topic = %m.topic,
                kind = ?m.kind,
                trace_id = ?m.metadata.trace_id,
                "bus message"
            );
        });

        Self {
            policy: PolicyGate::from_config(&config.policy),
            resilience: ResilienceWrapper::from_config(&config.resilience),
            routing: RwLock::new(RoutingTable::new()),
            selector: Box::new(RandomSelector),
            dispatcher,
            bus,
            config,
            started_at: Utc::now(),
            started: Instant::now(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn with_selector(mut self, selector: Box<dyn AdapterSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn policy(&self) -> &PolicyGate {
        &self.policy
    }

    pub fn resilience(&self) -> &ResilienceWrapper {
        &self.resilience
    }

    fn routing(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn routing_mut(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing.write().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Task Submission
    // =========================================================================

    /// Validate raw JSON and route it.
    pub async fn submit_raw(&self, raw: &Value) -> Result<Value> {
        let envelope = envelope::validate(raw)?;
        self.submit(envelope).await
    }

    /// Route a validated envelope and return the target's result.
    pub async fn submit(&self, envelope: Envelope) -> Result<Value> {
        let started = Instant::now();
        let outcome = self.route(&envelope).await;

        match &outcome {
            Ok((route_label, _)) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    trace_id = %envelope.trace_id(),
                    source = %envelope.source,
                    target = %envelope.target,
                    route = %route_label,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task completed"
                );
                self.bus.publish(
                    topics::TASK_COMPLETED,
                    json!({
                        "trace_id": envelope.trace_id(),
                        "target": envelope.target,
                        "route": route_label,
                        "duration_ms": started.elapsed().as_millis() as u64,
                    }),
                    MessageMetadata::traced(envelope.trace_id().clone()),
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    trace_id = %envelope.trace_id(),
                    source = %envelope.source,
                    target = %envelope.target,
                    error_code = %e.code(),
                    error = %e,
                    "task failed"
                );
                self.bus.publish(
                    topics::TASK_FAILED,
                    json!({
                        "trace_id": envelope.trace_id(),
                        "target": envelope.target,
                        "error_code": e.code(),
                        "message": e.to_string(),
                    }),
                    MessageMetadata::traced(envelope.trace_id().clone()),
                );
            }
        }

        outcome.map(|(_, value)| value)
    }

    async fn route(&self, envelope: &Envelope) -> Result<(String, Value)> {
        if envelope.is_kernel_bound() || envelope.intent != Intent::Invoke {
            return Err(Error::protocol(format!(
                "only invoke envelopes addressed to a service can be routed (got {} → '{}')",
                envelope.intent, envelope.target
            )));
        }

        self.policy.enforce(envelope)?;

        let route = self
            .routing()
            .resolve(&envelope.target, self.selector.as_ref())?;

        match route {
            Route::Builtin(service) => {
                let value = with_recovery(|| Ok(service.invoke(envelope)), service.name())?;
                Ok((service.name().to_string(), value))
            }
            Route::Adapter(adapter_id) => {
                let outcome = self
                    .resilience
                    .execute(self.dispatcher.as_ref(), &adapter_id, envelope)
                    .await;
                self.routing_mut()
                    .record_result(&adapter_id, outcome.is_ok());
                outcome.map(|value| (adapter_id.to_string(), value))
            }
        }
    }

    // =========================================================================
    // Adapter Lifecycle
    // =========================================================================

    /// Track a freshly registered adapter and make it routable under its
    /// language and capabilities.
    ///
    /// Rejects an id that is already held by another live connection.
    pub fn register_adapter(&self, registration: AdapterRegistration) -> Result<()> {
        let registration = registration.with_status(AdapterStatus::Connected);
        let id = registration.id.clone();
        let keys = registration.route_keys();

        {
            let mut routing = self.routing_mut();
            if let Some(existing) = routing.adapter(&id) {
                if existing.status.is_routable() && held_elsewhere(existing, &registration) {
                    return Err(Error::configuration(format!(
                        "adapter id '{id}' is already connected"
                    )));
                }
            }
            routing.upsert_adapter(registration.clone());
            for key in &keys {
                routing.register_adapter(key, &id);
            }
        }

        tracing::info!(
            adapter_id = %id,
            language = %registration.language,
            capabilities = ?registration.capabilities,
            "adapter registered"
        );
        self.bus.publish(
            topics::ADAPTER_REGISTERED,
            json!({
                "adapter_id": id,
                "language": registration.language,
                "capabilities": registration.capabilities,
                "runtime": registration.runtime,
            }),
            MessageMetadata::default(),
        );
        Ok(())
    }

    /// Record an adapter that missed its handshake deadline. It is listed
    /// for diagnostics but never routed to.
    ///
    /// A routable registration or one held by another open connection is
    /// left untouched and the call fails like a duplicate registration.
    pub fn mark_handshake_timeout(&self, registration: AdapterRegistration) -> Result<()> {
        let id = registration.id.clone();
        let mut routing = self.routing_mut();
        if let Some(existing) = routing.adapter(&id) {
            if existing.status.is_routable() || held_elsewhere(existing, &registration) {
                return Err(Error::configuration(format!(
                    "adapter id '{id}' is already registered"
                )));
            }
        }

        tracing::warn!(adapter_id = %id, "adapter missed handshake deadline");
        for key in registration.route_keys() {
            routing.unregister_adapter(&key, &id);
        }
        routing.upsert_adapter(registration.with_status(AdapterStatus::Timeout));
        Ok(())
    }

    /// Forget an adapter whose transport closed.
    pub fn disconnect_adapter(&self, id: &AdapterId) -> Option<AdapterRegistration> {
        let removed = self.routing_mut().remove_adapter(id);
        self.resilience.forget(id);

        if let Some(reg) = &removed {
            tracing::info!(adapter_id = %id, "adapter disconnected");
            self.bus.publish(
                topics::ADAPTER_DISCONNECTED,
                json!({
                    "adapter_id": id,
                    "language": reg.language,
                    "status": AdapterStatus::Disconnected,
                }),
                MessageMetadata::default(),
            );
        }
        removed
    }

    /// Forget every adapter registered over the given transport connection.
    pub fn disconnect_connection(&self, connection_id: u64) -> Vec<AdapterId> {
        let owned: Vec<AdapterId> = self
            .routing()
            .adapters()
            .into_iter()
            .filter(|reg| {
                reg.connection
                    .as_ref()
                    .is_some_and(|c| c.connection_id() == connection_id)
            })
            .map(|reg| reg.id)
            .collect();
        for id in &owned {
            self.disconnect_adapter(id);
        }
        owned
    }

    /// Refresh liveness after a pong or any inbound frame.
    pub fn touch_adapter(&self, id: &AdapterId) -> bool {
        self.routing_mut().touch(id)
    }

    pub fn adapter_status(&self, id: &AdapterId) -> Option<AdapterStatus> {
        self.routing().status(id)
    }

    /// Connections of every routable adapter, for heartbeats.
    pub fn live_connections(&self) -> Vec<(AdapterId, ConnectionHandle)> {
        self.routing()
            .adapters()
            .into_iter()
            .filter(|reg| reg.status.is_routable())
            .filter_map(|reg| reg.connection.map(|c| (reg.id, c)))
            .collect()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn task_stats(&self) -> TaskStats {
        TaskStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn health(&self) -> KernelHealth {
        let (adapters, routing) = {
            let table = self.routing();
            (table.adapters(), table.stats())
        };
        KernelHealth {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            started_at: self.started_at,
            uptime_secs: self.uptime_secs(),
            selector: self.selector.name(),
            adapters,
            routing,
            bus: self.bus.stats(),
            breakers: self.resilience.snapshot(),
            tasks: self.task_stats(),
        }
    }

    /// Built-in services and adapter routes.
    pub fn services(&self) -> Value {
        let builtin: Vec<Value> = BuiltinService::ALL
            .iter()
            .map(|s| json!({ "name": s.name(), "description": s.description() }))
            .collect();
        json!({
            "builtin": builtin,
            "routes": self.routing().routes(),
        })
    }
}

/// True when `existing` belongs to an open connection other than the one
/// `incoming` arrived on.
fn held_elsewhere(existing: &AdapterRegistration, incoming: &AdapterRegistration) -> bool {
    let Some(held) = existing.connection.as_ref().filter(|c| !c.is_closed()) else {
        return false;
    };
    incoming
        .connection
        .as_ref()
        .map_or(true, |c| c.connection_id() != held.connection_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::MockDispatcher;
    use crate::routing::RoundRobinSelector;
    use crate::types::ErrorCode;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn kernel() -> Kernel {
        Kernel::new(Config::default())
    }

    fn adapter(id: &str, language: &str) -> AdapterRegistration {
        AdapterRegistration::new(AdapterId::from_string(id).unwrap(), language)
    }

    fn record_topic(kernel: &Kernel, topic: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        kernel
            .bus()
            .subscribe(topic, move |m: &Message| sink.lock().unwrap().push(m.payload.clone()));
        seen
    }

    #[tokio::test]
    async fn test_math_add() {
        let out = kernel()
            .submit_raw(&json!({
                "source": "cli",
                "target": "math-service",
                "payload": {"operation": "add", "a": 10, "b": 5}
            }))
            .await
            .unwrap();
        assert_eq!(out["status"], "ok");
        assert_eq!(out["result"], 15);
    }

    #[tokio::test]
    async fn test_invalid_envelope_never_routed() {
        let k = kernel();
        let err = k
            .submit_raw(&json!({"target": "math-service", "payload": {}}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidEnvelope);
        assert_eq!(k.task_stats(), TaskStats::default());
    }

    #[tokio::test]
    async fn test_no_route_lists_adapters() {
        let k = kernel();
        k.register_adapter(adapter("node-1", "javascript")).unwrap();

        let err = k
            .submit(Envelope::new("cli", "python", Intent::Invoke, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.to_body()["available_adapters"], json!(["node-1"]));
        assert_eq!(k.task_stats().failed, 1);
    }

    #[tokio::test]
    async fn test_control_envelope_rejected_on_data_path() {
        let err = kernel()
            .submit(Envelope::control("cli", Intent::Ping, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[tokio::test]
    async fn test_policy_runs_before_routing() {
        let k = kernel();
        k.policy().restrict("math-service", &["alice".to_string()]);
        let err = k
            .submit(Envelope::new("bob", "math-service", Intent::Invoke, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessDenied);
    }

    #[tokio::test]
    async fn test_adapter_route_goes_through_dispatcher() {
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_dispatch()
            .withf(|id, env| id.as_str() == "py-1" && env.payload["x"] == 1)
            .times(1)
            .returning(|_, _| Ok(json!({"status": "ok", "result": 2})));

        let k = kernel().with_dispatcher(Arc::new(dispatcher));
        k.register_adapter(adapter("py-1", "python")).unwrap();
        let completed = record_topic(&k, topics::TASK_COMPLETED);

        let out = k
            .submit(Envelope::new("cli", "python", Intent::Invoke, json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(out["result"], 2);
        assert_eq!(completed.lock().unwrap()[0]["route"], "py-1");

        let health = k.health();
        assert_eq!(health.adapters[0].metrics.total_messages, 1);
        assert_eq!(health.tasks.completed, 1);
    }

    #[tokio::test]
    async fn test_register_and_disconnect_events() {
        let k = kernel().with_selector(Box::new(RoundRobinSelector::new()));
        let registered = record_topic(&k, topics::ADAPTER_REGISTERED);
        let gone = record_topic(&k, topics::ADAPTER_DISCONNECTED);

        let reg = adapter("rb-1", "ruby").with_capabilities(vec!["scripting".into()]);
        k.register_adapter(reg).unwrap();
        assert_eq!(
            k.services()["routes"],
            json!({"ruby": ["rb-1"], "scripting": ["rb-1"]})
        );
        assert_eq!(registered.lock().unwrap()[0]["adapter_id"], "rb-1");

        let id = AdapterId::from_string("rb-1").unwrap();
        assert!(k.disconnect_adapter(&id).is_some());
        assert!(k.disconnect_adapter(&id).is_none());
        assert_eq!(gone.lock().unwrap().len(), 1);
        assert_eq!(k.services()["routes"], json!({}));
        assert_eq!(k.health().selector, "round_robin");
    }

    #[tokio::test]
    async fn test_timed_out_adapter_is_not_routable() {
        let k = kernel();
        k.mark_handshake_timeout(adapter("py-late", "python")).unwrap();
        let id = AdapterId::from_string("py-late").unwrap();
        assert_eq!(k.adapter_status(&id), Some(AdapterStatus::Timeout));

        let err = k
            .submit(Envelope::new("cli", "python", Intent::Invoke, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoRoute);
    }

    #[tokio::test]
    async fn test_timeout_never_overwrites_connected_adapter() {
        let k = kernel();
        k.register_adapter(adapter("py-1", "python")).unwrap();

        let err = k
            .mark_handshake_timeout(adapter("py-1", "python"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);

        let id = AdapterId::from_string("py-1").unwrap();
        assert_eq!(k.adapter_status(&id), Some(AdapterStatus::Connected));
        assert_eq!(k.services()["routes"], json!({"python": ["py-1"]}));
    }

    #[test]
    fn test_services_lists_builtins() {
        let services = kernel().services();
        let names: Vec<&str> = services["builtin"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["echo-service", "math-service", "string-service"]);
    }
}
