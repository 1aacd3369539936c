use serde_json::{json, Number, Value};

use super::{failed, ok, BuiltinService};
use crate::types::TraceId;

const INVALID_PAYLOAD: &str = "Invalid payload. Expected: { operation|'op', a:number, b:number }";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "add" => Some(Op::Add),
            "sub" | "subtract" => Some(Op::Sub),
            "mul" | "multiply" => Some(Op::Mul),
            "div" | "divide" => Some(Op::Div),
            _ => None,
        }
    }
}

/// Integral results render as JSON integers so `10 + 5` is `15`, not `15.0`.
fn to_json_number(x: f64) -> Option<Value> {
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        return Some(json!(x as i64));
    }
    Number::from_f64(x).map(Value::Number)
}

pub(super) fn handle(payload: &Value, trace_id: &TraceId) -> Value {
    let op = payload
        .get("operation")
        .or_else(|| payload.get("op"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let a = payload.get("a").and_then(Value::as_f64);
    let b = payload.get("b").and_then(Value::as_f64);

    let (Some(raw_op), Some(a), Some(b)) = (op, a, b) else {
        return failed(BuiltinService::Math, trace_id, INVALID_PAYLOAD.to_string(), payload);
    };

    let Some(op) = Op::parse(raw_op) else {
        return failed(
            BuiltinService::Math,
            trace_id,
            format!("Unsupported operation '{raw_op}'. Use one of: add, sub, mul, div"),
            payload,
        );
    };

    let result = match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul => a * b,
        Op::Div if b == 0.0 => {
            return failed(
                BuiltinService::Math,
                trace_id,
                "Division by zero".to_string(),
                payload,
            )
        }
        Op::Div => a / b,
    };

    let Some(result) = to_json_number(result) else {
        return failed(
            BuiltinService::Math,
            trace_id,
            "Result is not a finite number".to_string(),
            payload,
        );
    };

    ok(
        BuiltinService::Math,
        trace_id,
        json!({
            "operation": raw_op,
            "a": payload["a"],
            "b": payload["b"],
            "result": result,
        }),
    )
}
