use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::name::qualify;

/// A named, schema-described callable exposed by an MCP server.
/// Mirrors spec.md §3 `Tool`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub original_name: String,
    pub description: String,
    pub input_schema: Value,
    pub owning_service_name: String,
}

impl Tool {
    pub fn qualified_name(&self) -> String {
        qualify(&self.owning_service_name, &self.original_name)
    }
}

/// One entry of the successful result of a `tools/call`, mirroring MCP's
/// `CallToolResult.content[]` shape (spec.md §8 invariant 6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { data: String, mime_type: String },
    Resource { resource: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn qualified_name_uses_reserved_delimiter() {
        let tool = Tool {
            original_name: "add".into(),
            description: "adds".into(),
            input_schema: json!({"type": "object"}),
            owning_service_name: "calc".into(),
        };
        assert_eq!(tool.qualified_name(), "calc__add");
    }

    #[test]
    fn tool_result_content_has_at_least_one_entry() {
        let result = ToolResult::text("8");
        assert!(!result.content.is_empty());
        assert!(!result.is_error);
    }
}
