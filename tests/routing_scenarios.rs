//! End-to-end routing scenarios through the kernel, with in-process adapters
//! answering on their execute topics.

use polyroute_core::commbus::{Message, MessageKind};
use polyroute_core::envelope::{Envelope, Intent};
use polyroute_core::kernel::{topics, Kernel};
use polyroute_core::resilience::CircuitState;
use polyroute_core::routing::AdapterRegistration;
use polyroute_core::types::{AdapterId, Config, ErrorCode};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn id(s: &str) -> AdapterId {
    AdapterId::from_string(s).unwrap()
}

/// Register `adapter_id` for `language` and answer its execute topic with
/// `respond(attempt, envelope)`. Returns the call counter.
fn in_process_adapter<F>(kernel: &Kernel, adapter_id: &str, language: &str, respond: F) -> Arc<AtomicUsize>
where
    F: Fn(usize, &Envelope) -> Option<Result<Value, String>> + Send + Sync + 'static,
{
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let bus = kernel.bus().clone();
    kernel.bus().subscribe(id(adapter_id).execute_topic(), move |m: &Message| {
        if m.kind != MessageKind::Request {
            return;
        }
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let env: Envelope = serde_json::from_value(m.payload.clone()).unwrap();
        let reply_to = m.metadata.response_topic.clone().unwrap();
        match respond(attempt, &env) {
            Some(Ok(value)) => {
                bus.publish_message(Message::response(reply_to, value, None));
            }
            Some(Err(error)) => {
                bus.publish_message(Message::response(reply_to, Value::Null, Some(error)));
            }
            None => {}
        }
    });
    kernel
        .register_adapter(AdapterRegistration::new(id(adapter_id), language))
        .unwrap();
    calls
}

fn invoke(target: &str, payload: Value) -> Envelope {
    Envelope::new("scenario", target, Intent::Invoke, payload)
}

fn single_attempt_config() -> Config {
    let mut config = Config::default();
    config.resilience.max_attempts = 1;
    config
}

#[tokio::test]
async fn test_builtin_services() {
    let kernel = Kernel::new(Config::default());

    let out = kernel
        .submit(invoke("math-service", json!({"operation": "add", "a": 10, "b": 5})))
        .await
        .unwrap();
    assert_eq!(out["result"], 15);

    let out = kernel
        .submit(invoke("string-service", json!({"operation": "reverse", "text": "hello"})))
        .await
        .unwrap();
    assert_eq!(out["result"], "olleh");

    let out = kernel
        .submit(invoke("math-service", json!({"operation": "div", "a": 1, "b": 0})))
        .await
        .unwrap();
    assert_eq!(out["status"], "error");
    assert_eq!(out["error"], "Division by zero");

    let env = invoke("echo-service", json!({"hi": 1}));
    let trace = env.trace_id().to_string();
    let out = kernel.submit(env).await.unwrap();
    assert_eq!(out["trace_id"], trace);
    assert_eq!(out["received"], json!({"hi": 1}));
}

#[tokio::test]
async fn test_adapter_sees_original_trace_id() {
    let kernel = Kernel::new(Config::default());
    in_process_adapter(&kernel, "py-1", "python", |_, env| {
        Some(Ok(json!({"status": "ok", "trace": env.trace_id().as_str()})))
    });

    let env = invoke("python", json!({}));
    let trace = env.trace_id().to_string();
    let out = kernel.submit(env).await.unwrap();
    assert_eq!(out["trace"], trace);
}

#[tokio::test]
async fn test_capability_routing() {
    let kernel = Kernel::new(Config::default());
    let bus = kernel.bus().clone();
    kernel.bus().subscribe("adapter:gpu-1:execute", move |m: &Message| {
        if m.kind == MessageKind::Request {
            let to = m.metadata.response_topic.clone().unwrap();
            bus.publish_message(Message::response(to, json!({"status": "ok", "on": "gpu"}), None));
        }
    });
    kernel
        .register_adapter(
            AdapterRegistration::new(id("gpu-1"), "python").with_capabilities(vec!["cuda".into()]),
        )
        .unwrap();

    let out = kernel.submit(invoke("cuda", json!({}))).await.unwrap();
    assert_eq!(out["on"], "gpu");
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let kernel = Kernel::new(Config::default());
    let calls = in_process_adapter(&kernel, "py-1", "python", |attempt, _| {
        if attempt == 1 {
            Some(Err("worker restarting".to_string()))
        } else {
            Some(Ok(json!({"status": "ok", "attempt": attempt})))
        }
    });

    let out = kernel.submit(invoke("python", json!({}))).await.unwrap();
    assert_eq!(out["attempt"], 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(kernel.resilience().state(&id("py-1")), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_silent_adapter_times_out_without_deregistering() {
    let mut config = single_attempt_config();
    config.dispatch.request_timeout = Duration::from_secs(30);
    let kernel = Kernel::new(config);
    in_process_adapter(&kernel, "py-mute", "python", |_, _| None);

    let err = kernel.submit(invoke("python", json!({}))).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(kernel.adapter_status(&id("py-mute")).is_some());
    assert_eq!(kernel.bus().stats().requests_timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_then_recovers() {
    let kernel = Kernel::new(single_attempt_config());
    let healthy = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&healthy);
    let calls = in_process_adapter(&kernel, "rb-1", "ruby", move |_, _| {
        if *flag.lock().unwrap() {
            Some(Ok(json!({"status": "ok"})))
        } else {
            Some(Err("boom".to_string()))
        }
    });

    for _ in 0..5 {
        let err = kernel.submit(invoke("ruby", json!({}))).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DispatchFailed);
    }
    let err = kernel.submit(invoke("ruby", json!({}))).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    *healthy.lock().unwrap() = true;
    tokio::time::advance(Duration::from_secs(10)).await;

    kernel.submit(invoke("ruby", json!({}))).await.unwrap();
    assert_eq!(kernel.resilience().state(&id("rb-1")), CircuitState::Closed);
    assert_eq!(kernel.task_stats().failed, 6);
}

#[tokio::test]
async fn test_no_route_and_policy_are_terminal() {
    let kernel = Kernel::new(Config::default());
    let failed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failed);
    kernel.bus().subscribe(topics::TASK_FAILED, move |m: &Message| {
        sink.lock().unwrap().push(m.payload["error_code"].clone());
    });

    let err = kernel.submit(invoke("fortran", json!({}))).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoRoute);

    kernel.policy().restrict("math-service", &["admin".to_string()]);
    let err = kernel
        .submit(invoke("math-service", json!({"operation": "add", "a": 1, "b": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AccessDenied);

    assert_eq!(
        *failed.lock().unwrap(),
        vec![json!("NO_ROUTE"), json!("ACCESS_DENIED")]
    );
}

#[tokio::test]
async fn test_legacy_task_is_upgraded_and_routed() {
    let kernel = Kernel::new(Config::default());
    in_process_adapter(&kernel, "py-legacy", "python", |_, env| {
        Some(Ok(json!({
            "status": "ok",
            "function": env.entry.as_ref().and_then(|e| e.function.clone()),
            "args": env.payload.clone(),
        })))
    });

    let out = kernel
        .submit_raw(&json!({
            "udl_version": "1.0",
            "language": "python",
            "module": "stats",
            "function": "mean",
            "args": {"values": [1, 2, 3]}
        }))
        .await
        .unwrap();
    assert_eq!(out["function"], "mean");
    assert_eq!(out["args"], json!({"values": [1, 2, 3]}));
}
