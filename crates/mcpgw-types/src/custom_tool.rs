use serde_json::Value;

use crate::config::CustomToolHandlerConfig;
use crate::tool::ToolResult;

/// An in-process closure backing a `Function`-variant custom tool.
pub type CustomToolFn = std::sync::Arc<dyn Fn(&Value) -> ToolResult + Send + Sync>;

/// A resolved entry in the `customMCPTools` registry (spec.md §4.6).
/// Unlike [`CustomToolHandlerConfig`], the `Function` variant here carries
/// the actual closure, since it has no serializable wire form.
#[derive(Clone)]
pub struct CustomToolEntry {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: CustomToolHandler,
}

#[derive(Clone)]
pub enum CustomToolHandler {
    Mcp { server: String, tool: String },
    ProxyPlatform { platform: String, workflow_id: String },
    Http { url: String },
    Function(CustomToolFn),
}

impl From<CustomToolHandlerConfig> for CustomToolHandler {
    fn from(config: CustomToolHandlerConfig) -> Self {
        match config {
            CustomToolHandlerConfig::Mcp { server, tool } => CustomToolHandler::Mcp { server, tool },
            CustomToolHandlerConfig::ProxyPlatform {
                platform,
                workflow_id,
            } => CustomToolHandler::ProxyPlatform {
                platform,
                workflow_id,
            },
            CustomToolHandlerConfig::Http { url } => CustomToolHandler::Http { url },
            CustomToolHandlerConfig::Function => {
                unreachable!("Function handlers have no wire representation and are never decoded")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcp_handler_config_converts_by_exhaustive_match() {
        let config = CustomToolHandlerConfig::Mcp {
            server: "weather".into(),
            tool: "forecast".into(),
        };
        match CustomToolHandler::from(config) {
            CustomToolHandler::Mcp { server, tool } => {
                assert_eq!(server, "weather");
                assert_eq!(tool, "forecast");
            }
            _ => panic!("expected Mcp variant"),
        }
    }
}
