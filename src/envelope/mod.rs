//! Envelope - the unit of communication.
//!
//! Every task, control message and reply that crosses the kernel is an
//! [`Envelope`]. Envelopes arrive as loose JSON from clients and adapters and
//! only become typed values through [`validate`], which normalizes aliases,
//! upgrades the legacy flat model and fills defaults.
//!
//! Fields:
//! - **Addressing**: `source`, `target`, `intent`
//! - **Body**: `payload` (opaque to the kernel, interpreted by the target)
//! - **Meta**: trace id, timestamp, correlation id, priority, caller extras
//! - **Entry**: optional code entry point when the target is a language runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Result, TraceId};

pub mod enums;
mod validate;

pub use enums::*;
pub use validate::validate;

/// Protocol version stamped on envelopes the kernel creates.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Reserved target for control-path envelopes.
pub const KERNEL_TARGET: &str = "kernel";

/// Envelope metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Meta {
    pub trace_id: TraceId,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default)]
    pub priority: Priority,

    /// Caller-supplied keys the kernel does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    pub fn new() -> Self {
        Self {
            trace_id: TraceId::new(),
            timestamp: Utc::now(),
            correlation_id: None,
            priority: Priority::Normal,
            extra: Map::new(),
        }
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}

/// Code entry point inside a language runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A validated envelope.
///
/// Immutable once dispatched: the kernel clones rather than mutates when it
/// needs a derived envelope (replies, wrapped dispatches).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub version: String,
    pub source: String,
    pub target: String,
    pub intent: Intent,

    #[serde(default)]
    pub payload: Value,

    pub meta: Meta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryPoint>,
}

impl Envelope {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        intent: Intent,
        payload: Value,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            source: source.into(),
            target: target.into(),
            intent,
            payload,
            meta: Meta::new(),
            entry: None,
        }
    }

    /// Control envelope addressed to the kernel.
    pub fn control(source: impl Into<String>, intent: Intent, payload: Value) -> Self {
        Self::new(source, KERNEL_TARGET, intent, payload)
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.meta.trace_id = trace_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.meta.correlation_id = Some(correlation_id.into());
        self
    }

    /// Build the `response` envelope answering this one.
    ///
    /// The reply goes back to `self.source` and keeps the trace id and
    /// correlation id unchanged.
    pub fn reply(&self, from: impl Into<String>, payload: Value) -> Envelope {
        let mut meta = Meta::new();
        meta.trace_id = self.meta.trace_id.clone();
        meta.correlation_id = self.meta.correlation_id.clone();
        meta.priority = self.meta.priority;
        Envelope {
            version: PROTOCOL_VERSION.to_string(),
            source: from.into(),
            target: self.source.clone(),
            intent: Intent::Response,
            payload,
            meta,
            entry: None,
        }
    }

    /// Whether this envelope belongs on the kernel's control path.
    pub fn is_kernel_bound(&self) -> bool {
        self.target == KERNEL_TARGET
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.meta.trace_id
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
