//! Built-in services.
//!
//! Pure functions resolved by a fixed name before any adapter lookup. Each
//! returns a `{status: "ok" | "error", ...}` object; business errors (bad
//! operation, division by zero) are results, not kernel errors.

mod echo;
mod math;
mod string;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::envelope::Envelope;
use crate::types::TraceId;

/// Fixed set of services the kernel answers itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinService {
    #[serde(rename = "echo-service")]
    Echo,
    #[serde(rename = "math-service")]
    Math,
    #[serde(rename = "string-service")]
    String,
}

impl BuiltinService {
    pub const ALL: [BuiltinService; 3] = [
        BuiltinService::Echo,
        BuiltinService::Math,
        BuiltinService::String,
    ];

    pub fn from_target(target: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == target)
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltinService::Echo => "echo-service",
            BuiltinService::Math => "math-service",
            BuiltinService::String => "string-service",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            BuiltinService::Echo => "Built-in echo test service",
            BuiltinService::Math => "Arithmetic over {operation|op, a, b}: add, sub, mul, div",
            BuiltinService::String => {
                "Text transforms over {operation, text}: upper, lower, trim, length, reverse"
            }
        }
    }

    /// Run the service against `envelope`.
    pub fn invoke(self, envelope: &Envelope) -> Value {
        tracing::debug!(
            service = self.name(),
            source = %envelope.source,
            trace_id = %envelope.trace_id(),
            "invoking built-in service"
        );
        match self {
            BuiltinService::Echo => echo::handle(envelope),
            BuiltinService::Math => math::handle(&envelope.payload, envelope.trace_id()),
            BuiltinService::String => string::handle(&envelope.payload, envelope.trace_id()),
        }
    }
}

impl std::fmt::Display for BuiltinService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn reply(service: BuiltinService, trace_id: &TraceId, status: &str, fields: Value) -> Value {
    let mut body = Map::new();
    body.insert("status".into(), json!(status));
    body.insert("service".into(), json!(service.name()));
    body.insert("trace_id".into(), json!(trace_id));
    if let Value::Object(fields) = fields {
        body.extend(fields);
    }
    body.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    Value::Object(body)
}

fn ok(service: BuiltinService, trace_id: &TraceId, fields: Value) -> Value {
    reply(service, trace_id, "ok", fields)
}

fn failed(service: BuiltinService, trace_id: &TraceId, error: String, received: &Value) -> Value {
    tracing::debug!(service = service.name(), trace_id = %trace_id, %error, "built-in service rejected payload");
    reply(
        service,
        trace_id,
        "error",
        json!({ "error": error, "received": received }),
    )
}
