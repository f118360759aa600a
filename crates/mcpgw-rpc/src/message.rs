use mcpgw_transport::RawMessage;
use serde_json::{json, Value};

/// The outcome of an inbound response's `result`/`error` member.
///
/// `cancelled` is never set by `classify()` — it distinguishes a pending
/// call drained by `JsonRpcSession::shutdown()`/`disconnect()` with no
/// underlying transport cause from one that failed on an in-band JSON-RPC
/// error response, so `call()` can surface `GatewayError::Cancelled` for
/// the former instead of a misleadingly recoverable `RemoteError`.
#[derive(Clone)]
pub(crate) struct RemoteFailure {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
    pub cancelled: bool,
}

/// How one inbound message classifies under JSON-RPC 2.0, preserving the
/// `id` member's exact JSON type (including the literal `0`, `""`, and
/// `null`) rather than coercing it to a gateway-internal representation.
pub(crate) enum Inbound {
    Response {
        id: Value,
        outcome: Result<Value, RemoteFailure>,
    },
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Invalid {
        raw: String,
        detail: String,
    },
}

/// Classifies a raw inbound message. A request is distinguished from a
/// notification by the *presence* of the `id` key, not its value — an
/// explicit `"id": null` is still a request per spec.md's id-handling rules.
pub(crate) fn classify(message: &RawMessage) -> Inbound {
    let Some(object) = message.value.as_object() else {
        return Inbound::Invalid {
            raw: message.raw.clone(),
            detail: "message is not a JSON object".to_string(),
        };
    };

    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Inbound::Invalid {
            raw: message.raw.clone(),
            detail: "missing or unsupported jsonrpc version".to_string(),
        };
    }

    let has_id = object.contains_key("id");
    let id = object.get("id").cloned().unwrap_or(Value::Null);

    if let Some(method) = object.get("method").and_then(Value::as_str) {
        let params = object.get("params").cloned().unwrap_or(Value::Null);
        return if has_id {
            Inbound::Request {
                id,
                method: method.to_string(),
                params,
            }
        } else {
            Inbound::Notification {
                method: method.to_string(),
                params,
            }
        };
    }

    if has_id {
        if let Some(result) = object.get("result") {
            return Inbound::Response {
                id,
                outcome: Ok(result.clone()),
            };
        }
        if let Some(error) = object.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let data = error.get("data").cloned();
            return Inbound::Response {
                id,
                outcome: Err(RemoteFailure {
                    code,
                    message,
                    data,
                    cancelled: false,
                }),
            };
        }
    }

    Inbound::Invalid {
        raw: message.raw.clone(),
        detail: "neither a request, a notification, nor a response".to_string(),
    }
}

pub(crate) fn build_request(id: Value, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub(crate) fn build_notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub(crate) fn build_result_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub(crate) fn build_error_response(id: Value, code: i64, message: String, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(value: Value) -> RawMessage {
        RawMessage::new(value.to_string(), value)
    }

    #[test]
    fn request_is_distinguished_from_notification_by_id_presence() {
        let request = raw(json!({"jsonrpc":"2.0","id":1,"method":"ping"}));
        match classify(&request) {
            Inbound::Request { id, method, .. } => {
                assert_eq!(id, json!(1));
                assert_eq!(method, "ping");
            }
            _ => panic!("expected Request"),
        }

        let notification = raw(json!({"jsonrpc":"2.0","method":"notifications/initialized"}));
        assert!(matches!(classify(&notification), Inbound::Notification { .. }));
    }

    #[test]
    fn request_with_explicit_null_id_is_still_a_request() {
        let message = raw(json!({"jsonrpc":"2.0","id":null,"method":"ping"}));
        assert!(matches!(classify(&message), Inbound::Request { .. }));
    }

    #[test]
    fn zero_and_empty_string_ids_round_trip() {
        let zero = raw(json!({"jsonrpc":"2.0","id":0,"result":{}}));
        match classify(&zero) {
            Inbound::Response { id, .. } => assert_eq!(id, json!(0)),
            _ => panic!("expected Response"),
        }

        let empty = raw(json!({"jsonrpc":"2.0","id":"","result":{}}));
        match classify(&empty) {
            Inbound::Response { id, .. } => assert_eq!(id, json!("")),
            _ => panic!("expected Response"),
        }
    }

    #[test]
    fn error_response_carries_code_message_and_data() {
        let message = raw(json!({
            "jsonrpc":"2.0","id":7,
            "error":{"code":-32601,"message":"not found","data":{"tool":"x"}},
        }));
        match classify(&message) {
            Inbound::Response {
                outcome: Err(failure),
                ..
            } => {
                assert_eq!(failure.code, -32601);
                assert_eq!(failure.message, "not found");
                assert_eq!(failure.data, Some(json!({"tool":"x"})));
            }
            _ => panic!("expected failed Response"),
        }
    }

    #[test]
    fn missing_jsonrpc_version_is_invalid() {
        let message = raw(json!({"id":1,"result":{}}));
        assert!(matches!(classify(&message), Inbound::Invalid { .. }));
    }

    #[test]
    fn build_request_preserves_id_value_verbatim() {
        let request = build_request(json!(0), "ping", Value::Null);
        assert_eq!(request["id"], json!(0));
    }
}
