use serde_json::{json, Value};

use super::{failed, ok, BuiltinService};
use crate::types::TraceId;

const INVALID_PAYLOAD: &str = "Invalid payload. Expected: { operation:string, text:string }";

pub(super) fn handle(payload: &Value, trace_id: &TraceId) -> Value {
    let operation = payload
        .get("operation")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let text = payload.get("text").and_then(Value::as_str);

    let (Some(operation), Some(text)) = (operation, text) else {
        return failed(BuiltinService::String, trace_id, INVALID_PAYLOAD.to_string(), payload);
    };

    let result = match operation {
        "upper" => json!(text.to_uppercase()),
        "lower" => json!(text.to_lowercase()),
        "trim" => json!(text.trim()),
        "length" => json!(text.chars().count()),
        "reverse" => json!(text.chars().rev().collect::<String>()),
        other => {
            return failed(
                BuiltinService::String,
                trace_id,
                format!(
                    "Unsupported operation '{other}'. Use one of: upper, lower, trim, length, reverse"
                ),
                payload,
            )
        }
    };

    ok(
        BuiltinService::String,
        trace_id,
        json!({ "operation": operation, "input": text, "result": result }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(payload: Value) -> Value {
        handle(&payload, &TraceId::from_string("t").unwrap())
    }

    #[test]
    fn test_operations() {
        assert_eq!(run(json!({"operation": "reverse", "text": "hello"}))["result"], "olleh");
        assert_eq!(run(json!({"operation": "upper", "text": "abc"}))["result"], "ABC");
        assert_eq!(run(json!({"operation": "lower", "text": "AbC"}))["result"], "abc");
        assert_eq!(run(json!({"operation": "trim", "text": "  x "}))["result"], "x");
        assert_eq!(run(json!({"operation": "length", "text": "héllo"}))["result"], 5);
    }

    #[test]
    fn test_unknown_operation() {
        let out = run(json!({"operation": "shout", "text": "a"}));
        assert_eq!(out["status"], "error");
        assert!(out["error"].as_str().unwrap().starts_with("Unsupported operation 'shout'"));
    }

    #[test]
    fn test_missing_text() {
        let out = run(json!({"operation": "upper"}));
        assert_eq!(out["error"], INVALID_PAYLOAD);
    }
}
