use std::collections::HashMap;

use mcpgw_types::{CustomToolEntry, CustomToolHandler, GatewayError, ToolResult};
use serde_json::Value;

/// Two entries in the `customMCPTools` registry share a name (spec.md
/// §4.6: "name uniqueness across the registry" is a core contract).
#[derive(Debug)]
pub struct DuplicateCustomToolName(pub String);

/// The custom-tool side channel (spec.md §4.6): a read-only registry the
/// manager consults only after no upstream tool matches a bare or
/// qualified name. Concrete handler implementations beyond `Http` and an
/// in-process `Function` closure are external collaborators per spec.md
/// §1; this registry only validates and routes to them.
#[derive(Default)]
pub struct CustomToolRegistry {
    entries: HashMap<String, CustomToolEntry>,
    order: Vec<String>,
}

impl CustomToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a sequence of entries, rejecting duplicate
    /// names outright rather than silently keeping the last write.
    pub fn from_entries(entries: Vec<CustomToolEntry>) -> Result<Self, DuplicateCustomToolName> {
        let mut registry = Self::new();
        for entry in entries {
            registry.insert(entry)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, entry: CustomToolEntry) -> Result<(), DuplicateCustomToolName> {
        if self.entries.contains_key(&entry.name) {
            return Err(DuplicateCustomToolName(entry.name));
        }
        self.order.push(entry.name.clone());
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn has_custom_tool(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Read-only surface: entries in registration order.
    pub fn custom_tools(&self) -> Vec<&CustomToolEntry> {
        self.order.iter().filter_map(|name| self.entries.get(name)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validates `arguments` against the entry's `inputSchema`, then
    /// dispatches to its handler. Failures obey the same taxonomy upstream
    /// tool calls do (spec.md §4.6).
    pub async fn call(&self, name: &str, arguments: &Value) -> Result<ToolResult, GatewayError> {
        let entry = self.entries.get(name).ok_or_else(|| GatewayError::ToolNotFound {
            tool: name.to_string(),
        })?;

        validate_against_schema(name, &entry.input_schema, arguments)?;

        match &entry.handler {
            CustomToolHandler::Function(function) => Ok(function(arguments)),
            CustomToolHandler::Http { url } => call_http_handler(name, url, arguments).await,
            CustomToolHandler::Mcp { server, tool } => Err(GatewayError::RemoteError {
                service: server.clone(),
                code: -32603,
                message: format!(
                    "custom tool '{name}' forwards to upstream tool '{server}__{tool}', \
                     which is an external collaborator not provided by this crate"
                ),
                data: None,
            }),
            CustomToolHandler::ProxyPlatform { platform, .. } => Err(GatewayError::RemoteError {
                service: platform.clone(),
                code: -32603,
                message: format!(
                    "custom tool '{name}' forwards to platform '{platform}', \
                     which is an external collaborator not provided by this crate"
                ),
                data: None,
            }),
        }
    }
}

/// Minimal structural check of `arguments` against `{type: "object",
/// required: [...]}` style schemas — spec.md §4.6 names "input-schema
/// validation...before dispatch" as a contract without specifying a full
/// JSON-Schema validator, and nothing else in this crate needs one.
fn validate_against_schema(name: &str, schema: &Value, arguments: &Value) -> Result<(), GatewayError> {
    if schema.get("type").and_then(Value::as_str) == Some("object") && !arguments.is_null() && !arguments.is_object()
    {
        return Err(GatewayError::InvalidParams {
            message: format!("custom tool '{name}' requires an object for 'arguments'"),
        });
    }

    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let provided = arguments.as_object();
    for field in required {
        let Some(field) = field.as_str() else { continue };
        let present = provided.map(|obj| obj.contains_key(field)).unwrap_or(false);
        if !present {
            return Err(GatewayError::InvalidParams {
                message: format!("custom tool '{name}' is missing required argument '{field}'"),
            });
        }
    }
    Ok(())
}

async fn call_http_handler(name: &str, url: &str, arguments: &Value) -> Result<ToolResult, GatewayError> {
    let client = reqwest::Client::new();
    let response = client
        .post(url)
        .json(&serde_json::json!({ "name": name, "arguments": arguments }))
        .send()
        .await
        .map_err(|e| GatewayError::Transport {
            service: name.to_string(),
            message: format!("custom tool http handler request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(GatewayError::RemoteError {
            service: name.to_string(),
            code: -32603,
            message: format!("custom tool http handler returned HTTP {}", response.status()),
            data: None,
        });
    }

    let body: Value = response.json().await.map_err(|e| GatewayError::Transport {
        service: name.to_string(),
        message: format!("custom tool http handler returned malformed JSON: {e}"),
    })?;

    serde_json::from_value(body).map_err(|e| GatewayError::Transport {
        service: name.to_string(),
        message: format!("custom tool http handler response is not a ToolResult: {e}"),
    })
}
