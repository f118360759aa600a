use mcpgw_types::{GatewayError, Tool, ToolResult};
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "mcpgw";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `initialize` response body (spec.md §4.5's protocol table).
pub fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": true },
            "logging": {},
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": SERVER_VERSION,
        },
    })
}

/// `tools/list` response body: every tool's composite `service__tool` name
/// is advertised as `name`, never the bare upstream name.
pub fn tools_list_result(tools: &[Tool]) -> Value {
    let tools: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.qualified_name(),
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}

pub fn tool_result_to_value(result: &ToolResult) -> Value {
    serde_json::to_value(result).unwrap_or_else(|_| json!({"content": [], "isError": true}))
}

/// Parses and validates `tools/call` params per spec.md §4.5: `name` must
/// be a non-empty string; `arguments` must be an object when present, or
/// is treated as an empty object when omitted.
pub fn parse_call_params(params: &Value) -> Result<(String, Value), GatewayError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| GatewayError::InvalidParams {
            message: "tools/call requires a non-empty string 'name'".to_string(),
        })?;

    let arguments = match params.get("arguments") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(value @ Value::Object(_)) => value.clone(),
        Some(_) => {
            return Err(GatewayError::InvalidParams {
                message: "tools/call 'arguments' must be an object when provided".to_string(),
            })
        }
    };

    Ok((name.to_string(), arguments))
}

/// Best-effort `id` extraction from a malformed inbound message, per
/// spec.md §7: "parse errors...produce -32700 responses, but only when an
/// id can be extracted...; otherwise silently logged."
pub fn extract_id_from_malformed(raw: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(raw).ok()?;
    value.get("id").cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tools_list_advertises_composite_name() {
        let tool = Tool {
            original_name: "add".into(),
            description: "adds".into(),
            input_schema: json!({"type": "object"}),
            owning_service_name: "calc".into(),
        };
        let result = tools_list_result(&[tool]);
        assert_eq!(result["tools"][0]["name"], json!("calc__add"));
    }

    #[test]
    fn parse_call_params_rejects_empty_name() {
        let result = parse_call_params(&json!({"name": "", "arguments": {}}));
        assert!(matches!(result, Err(GatewayError::InvalidParams { .. })));
    }

    #[test]
    fn parse_call_params_rejects_non_object_arguments() {
        let result = parse_call_params(&json!({"name": "calc__add", "arguments": "nope"}));
        assert!(matches!(result, Err(GatewayError::InvalidParams { .. })));
    }

    #[test]
    fn parse_call_params_defaults_missing_arguments_to_empty_object() {
        let (name, arguments) = parse_call_params(&json!({"name": "calc__add"})).unwrap();
        assert_eq!(name, "calc__add");
        assert_eq!(arguments, json!({}));
    }

    #[test]
    fn extract_id_from_malformed_recovers_id_when_present() {
        let id = extract_id_from_malformed(r#"{"id": 7, "method": 5}"#);
        assert_eq!(id, Some(json!(7)));
    }

    #[test]
    fn extract_id_from_malformed_is_none_when_unparseable() {
        assert_eq!(extract_id_from_malformed("not json"), None);
    }
}
