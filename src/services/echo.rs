use serde_json::{json, Value};

use super::{ok, BuiltinService};
use crate::envelope::Envelope;

pub(super) fn handle(envelope: &Envelope) -> Value {
    ok(
        BuiltinService::Echo,
        envelope.trace_id(),
        json!({
            "description": BuiltinService::Echo.description(),
            "payload": {
                "received": envelope.payload,
                "message": "Echo response from polyroute kernel",
            },
        }),
    )
}
