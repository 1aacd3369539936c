//! Kernel control path: registration, subscription, liveness, and system
//! actions. Nothing here is ever routed to a service.

use serde_json::{json, Value};

use crate::envelope::{Envelope, Intent, KERNEL_TARGET};
use crate::ipc::connection::{forward_requests, ConnectionState};
use crate::kernel::Kernel;
use crate::routing::AdapterRegistration;
use crate::types::{AdapterId, Error, Result};

/// Handle one control envelope. Returns the reply to send, if any.
pub(crate) fn handle(
    kernel: &Kernel,
    state: &mut ConnectionState,
    envelope: &Envelope,
) -> Result<Option<Envelope>> {
    match envelope.intent {
        Intent::Register => register(kernel, state, envelope).map(Some),
        Intent::Subscribe => subscribe(kernel, state, envelope).map(Some),
        Intent::Ping => Ok(Some(pong(envelope))),
        Intent::Pong => {
            if let Some(id) = &state.adapter {
                kernel.touch_adapter(id);
            }
            Ok(None)
        }
        Intent::System => Ok(Some(system(kernel, envelope))),
        Intent::Invoke | Intent::Response => Err(Error::protocol(format!(
            "{} envelopes are not control messages",
            envelope.intent
        ))),
    }
}

fn register(kernel: &Kernel, state: &mut ConnectionState, envelope: &Envelope) -> Result<Envelope> {
    let payload = &envelope.payload;
    let id = payload
        .get("adapter_id")
        .or_else(|| payload.get("id"))
        .and_then(Value::as_str)
        .unwrap_or(&envelope.source);
    let id = AdapterId::from_string(id).map_err(|e| Error::protocol(format!("register: {e}")))?;

    if let Some(existing) = &state.adapter {
        if existing != &id {
            return Err(Error::protocol(format!(
                "connection already registered as '{existing}'"
            )));
        }
    }

    let language = payload
        .get("language")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("register: missing language"))?;
    let capabilities = payload
        .get("capabilities")
        .and_then(Value::as_array)
        .map(|caps| {
            caps.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut registration = AdapterRegistration::new(id.clone(), language)
        .with_capabilities(capabilities)
        .with_connection(state.handle.clone());
    if let Some(runtime) = payload.get("runtime").and_then(Value::as_str) {
        registration = registration.with_runtime(runtime);
    }

    let handshake_timeout = kernel.config().ipc.handshake_timeout;
    if state.adapter.is_none() && state.opened_at.elapsed() > handshake_timeout {
        kernel.mark_handshake_timeout(registration)?;
        return Err(Error::timeout(format!(
            "registration arrived after the {}ms handshake deadline",
            handshake_timeout.as_millis()
        )));
    }

    kernel.register_adapter(registration)?;
    state.adapter = Some(id.clone());

    Ok(envelope.reply(
        KERNEL_TARGET,
        json!({
            "status": "ok",
            "action": "register_adapter_ack",
            "adapter_id": id,
            "execute_topic": id.execute_topic(),
        }),
    ))
}

fn subscribe(kernel: &Kernel, state: &mut ConnectionState, envelope: &Envelope) -> Result<Envelope> {
    let topic = envelope
        .payload
        .get("topic")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(id) = &state.adapter else {
        return Err(Error::access_denied(
            "subscribe requires a registered adapter",
        ));
    };
    if topic != id.execute_topic() {
        return Err(Error::access_denied(format!(
            "adapter '{id}' may only subscribe to '{}'",
            id.execute_topic()
        )));
    }

    let subscription = kernel.bus().subscribe(
        topic,
        forward_requests(
            kernel.bus().clone(),
            state.handle.clone(),
            state.in_flight.clone(),
            kernel.config().dispatch.request_timeout,
        ),
    );
    state.subscriptions.push(subscription);
    tracing::debug!(adapter_id = %id, topic = %topic, "adapter subscribed");

    Ok(envelope.reply(
        KERNEL_TARGET,
        json!({ "status": "ok", "action": "subscribe_ack", "topic": topic }),
    ))
}

fn pong(envelope: &Envelope) -> Envelope {
    Envelope::new(KERNEL_TARGET, envelope.source.clone(), Intent::Pong, json!({}))
        .with_trace_id(envelope.trace_id().clone())
}

fn system(kernel: &Kernel, envelope: &Envelope) -> Envelope {
    let action = envelope.payload.get("action").and_then(Value::as_str);
    let body = match action {
        Some("stats") => match serde_json::to_value(kernel.health()) {
            Ok(stats) => json!({ "status": "ok", "action": "stats", "stats": stats }),
            Err(e) => Error::from(e).to_body(),
        },
        _ => json!({ "status": "ignored", "reason": "unknown_action" }),
    };
    envelope.reply(KERNEL_TARGET, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{AdapterStatus, ConnectionHandle};
    use crate::types::{Config, ErrorCode};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn state(id: u64) -> (ConnectionState, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(8);
        let peer = "127.0.0.1:9".parse().unwrap();
        (ConnectionState::new(id, peer, ConnectionHandle::new(id, tx)), rx)
    }

    fn register_env(id: &str) -> Envelope {
        Envelope::control(
            id,
            Intent::Register,
            json!({"adapter_id": id, "language": "python", "capabilities": ["ml"]}),
        )
    }

    #[tokio::test]
    async fn test_register_ack() {
        let kernel = Kernel::new(Config::default());
        let (mut st, _rx) = state(1);

        let reply = handle(&kernel, &mut st, &register_env("py-1")).unwrap().unwrap();
        assert_eq!(reply.intent, Intent::Response);
        assert_eq!(reply.payload["action"], "register_adapter_ack");
        assert_eq!(reply.payload["adapter_id"], "py-1");

        let id = AdapterId::from_string("py-1").unwrap();
        assert_eq!(kernel.adapter_status(&id), Some(AdapterStatus::Connected));
        assert_eq!(st.adapter, Some(id));
    }

    #[tokio::test]
    async fn test_second_live_connection_cannot_steal_id() {
        let kernel = Kernel::new(Config::default());
        let (mut first, _rx1) = state(1);
        let (mut second, _rx2) = state(2);
        handle(&kernel, &mut first, &register_env("py-1")).unwrap();

        let err = handle(&kernel, &mut second, &register_env("py-1")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_registration_times_out() {
        let kernel = Kernel::new(Config::default());
        let (mut st, _rx) = state(1);
        tokio::time::advance(Duration::from_secs(6)).await;

        let err = handle(&kernel, &mut st, &register_env("py-late")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        let id = AdapterId::from_string("py-late").unwrap();
        assert_eq!(kernel.adapter_status(&id), Some(AdapterStatus::Timeout));
        assert!(st.adapter.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_register_cannot_evict_live_adapter() {
        let kernel = Kernel::new(Config::default());
        let (mut owner, _rx1) = state(1);
        let (mut intruder, _rx2) = state(2);
        handle(&kernel, &mut owner, &register_env("py-1")).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let err = handle(&kernel, &mut intruder, &register_env("py-1")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
        assert!(intruder.adapter.is_none());

        let id = AdapterId::from_string("py-1").unwrap();
        assert_eq!(kernel.adapter_status(&id), Some(AdapterStatus::Connected));
        assert_eq!(kernel.services()["routes"]["python"], json!(["py-1"]));

        assert_eq!(kernel.disconnect_connection(1), vec![id.clone()]);
        assert_eq!(kernel.adapter_status(&id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_after_deadline_keeps_adapter_routable() {
        let kernel = Kernel::new(Config::default());
        let (mut st, _rx) = state(1);
        handle(&kernel, &mut st, &register_env("py-1")).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let reply = handle(&kernel, &mut st, &register_env("py-1")).unwrap().unwrap();
        assert_eq!(reply.payload["action"], "register_adapter_ack");

        let id = AdapterId::from_string("py-1").unwrap();
        assert_eq!(kernel.adapter_status(&id), Some(AdapterStatus::Connected));
        assert_eq!(kernel.services()["routes"]["python"], json!(["py-1"]));
    }

    #[tokio::test]
    async fn test_subscribe_only_own_execute_topic() {
        let kernel = Kernel::new(Config::default());
        let (mut st, _rx) = state(1);

        let sub = |topic: &str| Envelope::control("py-1", Intent::Subscribe, json!({"topic": topic}));
        let err = handle(&kernel, &mut st, &sub("adapter:py-1:execute")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessDenied);

        handle(&kernel, &mut st, &register_env("py-1")).unwrap();
        let err = handle(&kernel, &mut st, &sub("adapter:py-2:execute")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessDenied);

        let reply = handle(&kernel, &mut st, &sub("adapter:py-1:execute")).unwrap().unwrap();
        assert_eq!(reply.payload["action"], "subscribe_ack");
        assert_eq!(st.subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn test_ping_and_system() {
        let kernel = Kernel::new(Config::default());
        let (mut st, _rx) = state(1);

        let ping = Envelope::control("client", Intent::Ping, json!({}));
        let pong = handle(&kernel, &mut st, &ping).unwrap().unwrap();
        assert_eq!(pong.intent, Intent::Pong);
        assert_eq!(pong.trace_id(), ping.trace_id());

        let stats = Envelope::control("client", Intent::System, json!({"action": "stats"}));
        let reply = handle(&kernel, &mut st, &stats).unwrap().unwrap();
        assert_eq!(reply.payload["stats"]["status"], "ok");

        let other = Envelope::control("client", Intent::System, json!({"action": "reboot"}));
        let reply = handle(&kernel, &mut st, &other).unwrap().unwrap();
        assert_eq!(reply.payload, json!({"status": "ignored", "reason": "unknown_action"}));
    }

    #[tokio::test]
    async fn test_invoke_is_not_control() {
        let kernel = Kernel::new(Config::default());
        let (mut st, _rx) = state(1);
        let env = Envelope::control("client", Intent::Invoke, json!({}));
        let err = handle(&kernel, &mut st, &env).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }
}
