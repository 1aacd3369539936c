//! Envelope validation and normalization.
//!
//! Input goes through four stages:
//! 1. legacy detection and upgrade (flat `language`/`function`/`args`)
//! 2. JSON Schema structural check
//! 3. alias resolution and defaults
//! 4. per-intent rules
//!
//! Violations from every stage are collected so the caller sees all of them
//! at once.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

use super::{EntryPoint, Envelope, Intent, Meta, Priority, KERNEL_TARGET, PROTOCOL_VERSION};
use crate::types::{Error, Result, TraceId};

/// Source recorded on upgraded legacy envelopes that did not name one.
pub(crate) const LEGACY_SOURCE: &str = "legacy-upgrade";

/// Meta keys the kernel interprets; everything else lands in `Meta::extra`.
const KNOWN_META_KEYS: &[&str] = &["trace_id", "timestamp", "correlation_id", "priority"];

fn task_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "version": { "type": ["string", "number"] },
            "model_version": { "type": ["string", "number"] },
            "source": { "type": "string" },
            "target": {
                "type": ["string", "object"],
                "properties": {
                    "module": { "type": "string" },
                    "class": { "type": "string" },
                    "method": { "type": "string" },
                    "function": { "type": "string" },
                    "file": { "type": "string" },
                    "path": { "type": "string" }
                }
            },
            "intent": { "type": "string" },
            "task_type": { "type": "string" },
            "language": { "type": "string" },
            "priority": { "$ref": "#/definitions/priority" },
            "meta": { "$ref": "#/definitions/meta" },
            "context": { "$ref": "#/definitions/meta" }
        },
        "definitions": {
            "priority": { "type": "string", "enum": ["low", "normal", "high"] },
            "meta": {
                "type": "object",
                "properties": {
                    "trace_id": { "type": "string", "minLength": 1 },
                    "timestamp": { "type": "string" },
                    "correlation_id": { "type": "string" },
                    "source": { "type": "string" },
                    "priority": { "$ref": "#/definitions/priority" }
                }
            }
        }
    })
}

fn schema() -> Result<&'static jsonschema::Validator> {
    static SCHEMA: OnceLock<std::result::Result<jsonschema::Validator, String>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| jsonschema::validator_for(&task_schema()).map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| Error::internal(format!("envelope schema failed to compile: {e}")))
}

/// Validate and normalize a raw JSON envelope.
///
/// Returns [`Error::InvalidEnvelope`] listing every violation found. Never
/// panics on any input.
pub fn validate(raw: &Value) -> Result<Envelope> {
    let Some(obj) = raw.as_object() else {
        return Err(Error::invalid_envelope(vec![
            "envelope must be a JSON object".to_string(),
        ]));
    };

    let upgraded;
    let obj = if is_legacy(obj) {
        upgraded = upgrade_legacy(obj);
        &upgraded
    } else {
        obj
    };

    let mut violations = Vec::new();

    let as_value = Value::Object(obj.clone());
    for err in schema()?.iter_errors(&as_value) {
        let path = err.instance_path.to_string();
        if path.is_empty() {
            violations.push(err.to_string());
        } else {
            violations.push(format!("{path}: {err}"));
        }
    }
    if !violations.is_empty() {
        return Err(Error::invalid_envelope(violations));
    }

    let envelope = normalize(obj, &mut violations);
    match envelope {
        Some(envelope) if violations.is_empty() => Ok(envelope),
        _ => Err(Error::invalid_envelope(violations)),
    }
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn version_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize(obj: &Map<String, Value>, violations: &mut Vec<String>) -> Option<Envelope> {
    let empty = Map::new();
    let meta_obj = obj
        .get("meta")
        .or_else(|| obj.get("context"))
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let version = obj
        .get("version")
        .or_else(|| obj.get("model_version"))
        .and_then(version_string)
        .unwrap_or_else(|| PROTOCOL_VERSION.to_string());

    let source = non_empty_str(obj, "source").or_else(|| non_empty_str(meta_obj, "source"));
    if source.is_none() {
        violations.push("missing required field: source".to_string());
    }

    // An entry-point object routes by language; a string target routes by itself.
    let mut entry = None;
    let target = match obj.get("target") {
        Some(Value::Object(point)) => {
            match serde_json::from_value::<EntryPoint>(Value::Object(point.clone())) {
                Ok(point) => entry = Some(point),
                Err(e) => violations.push(format!("target: {e}")),
            }
            non_empty_str(obj, "language")
        }
        _ => non_empty_str(obj, "target").or_else(|| non_empty_str(obj, "language")),
    };
    if target.is_none() {
        violations.push("missing required field: target".to_string());
    }

    let intent = match obj
        .get("intent")
        .or_else(|| obj.get("task_type"))
        .and_then(Value::as_str)
    {
        None => Some(Intent::Invoke),
        Some(raw) => {
            let parsed = Intent::parse(raw);
            if parsed.is_none() {
                violations.push(format!("unknown intent '{raw}'"));
            }
            parsed
        }
    };

    let payload = match obj.get("payload").or_else(|| obj.get("data")) {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v) => v.clone(),
    };

    let meta = normalize_meta(obj, meta_obj, violations);

    let (source, target, intent) = (source?, target?, intent?);
    if meta.is_some() {
        check_intent_rules(intent, target, &payload, meta_obj, violations);
    }

    Some(Envelope {
        version,
        source: source.to_string(),
        target: target.to_string(),
        intent,
        payload,
        meta: meta?,
        entry,
    })
}

fn normalize_meta(
    obj: &Map<String, Value>,
    meta_obj: &Map<String, Value>,
    violations: &mut Vec<String>,
) -> Option<Meta> {
    let trace_id = match non_empty_str(meta_obj, "trace_id") {
        Some(raw) => TraceId::from_string(raw).ok()?,
        None => TraceId::new(),
    };

    let timestamp = match meta_obj.get("timestamp").and_then(Value::as_str) {
        None => Utc::now(),
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => {
                violations.push(format!("meta.timestamp '{raw}' is not RFC 3339: {e}"));
                return None;
            }
        },
    };

    let priority = meta_obj
        .get("priority")
        .or_else(|| obj.get("priority"))
        .and_then(Value::as_str)
        .and_then(Priority::parse)
        .unwrap_or_default();

    let extra = meta_obj
        .iter()
        .filter(|(k, _)| !KNOWN_META_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(Meta {
        trace_id,
        timestamp,
        correlation_id: non_empty_str(meta_obj, "correlation_id").map(str::to_string),
        priority,
        extra,
    })
}

fn check_intent_rules(
    intent: Intent,
    target: &str,
    payload: &Value,
    meta_obj: &Map<String, Value>,
    violations: &mut Vec<String>,
) {
    if intent.is_control() && target != KERNEL_TARGET {
        violations.push(format!(
            "{intent} envelopes must target '{KERNEL_TARGET}', got '{target}'"
        ));
    }

    match intent {
        Intent::Invoke | Intent::Register | Intent::System => {
            if !payload.is_object() {
                violations.push(format!("{intent} payload must be an object"));
            }
        }
        Intent::Subscribe => {
            if payload.get("topic").and_then(Value::as_str).is_none() {
                violations.push("subscribe payload requires a string 'topic'".to_string());
            }
        }
        Intent::Response => {
            if non_empty_str(meta_obj, "trace_id").is_none() {
                violations.push("response envelopes must carry meta.trace_id".to_string());
            }
        }
        Intent::Ping | Intent::Pong => {}
    }
}

/// Flat pre-1.0 model: `udl_version`, or `function`/`args` with no payload fields.
fn is_legacy(obj: &Map<String, Value>) -> bool {
    if obj.contains_key("udl_version") {
        return true;
    }
    let has_flat = obj.contains_key("function") || obj.contains_key("args");
    let has_current = ["payload", "data", "intent", "task_type"]
        .iter()
        .any(|k| obj.contains_key(*k));
    has_flat && !has_current
}

fn upgrade_legacy(obj: &Map<String, Value>) -> Map<String, Value> {
    let language = non_empty_str(obj, "language").unwrap_or("unknown");
    let source = non_empty_str(obj, "source").unwrap_or(LEGACY_SOURCE);

    let payload = match obj.get("args") {
        None | Some(Value::Null) => json!({}),
        Some(Value::Object(args)) => Value::Object(args.clone()),
        Some(other) => json!({ "args": other }),
    };

    let mut meta = obj
        .get("meta")
        .or_else(|| obj.get("context"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    meta.entry("source".to_string())
        .or_insert_with(|| Value::String(source.to_string()));

    let mut upgraded = Map::new();
    upgraded.insert("version".into(), json!(PROTOCOL_VERSION));
    upgraded.insert("source".into(), json!(source));
    upgraded.insert("language".into(), json!(language));
    upgraded.insert("intent".into(), json!(Intent::Invoke.as_str()));
    upgraded.insert("payload".into(), payload);
    upgraded.insert("meta".into(), Value::Object(meta));

    let mut entry = Map::new();
    for key in ["module", "function"] {
        if let Some(v) = obj.get(key).and_then(Value::as_str) {
            entry.insert(key.to_string(), json!(v));
        }
    }
    if entry.is_empty() {
        upgraded.insert("target".into(), json!(language));
    } else {
        upgraded.insert("target".into(), Value::Object(entry));
    }
    if let Some(priority) = obj.get("priority") {
        upgraded.insert("priority".into(), priority.clone());
    }
    upgraded
}
