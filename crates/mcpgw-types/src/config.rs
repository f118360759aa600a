use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport_config::TransportConfig;

/// The validated configuration object the manager consumes (spec.md §6).
/// Loading, editing, schema migration, and file-watch reload of this value
/// are explicitly out of scope for this crate; callers build it once (e.g.
/// by parsing a JSON file named by `XIAOZHI_CONFIG_DIR`) and hand it in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub mcp_endpoint: Option<String>,
    #[serde(default)]
    pub mcp_servers: HashMap<String, TransportConfig>,
    #[serde(default)]
    pub mcp_server_config: HashMap<String, ServerToolOverrides>,
    #[serde(default, rename = "customMCP")]
    pub custom_mcp: Option<CustomMcpConfig>,
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerToolOverrides {
    #[serde(default)]
    pub tools: HashMap<String, ToolOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOverride {
    pub enable: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default = "default_heartbeat_interval_ms", rename = "heartbeatInterval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms", rename = "heartbeatTimeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval_ms", rename = "reconnectInterval")]
    pub reconnect_interval_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}
fn default_reconnect_interval_ms() -> u64 {
    2_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomMcpConfig {
    #[serde(default)]
    pub tools: Vec<CustomToolEntryConfig>,
}

/// Wire shape of one `customMCPTools` registry entry (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomToolEntryConfig {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: CustomToolHandlerConfig,
}

/// Tagged variant per spec.md's REDESIGN FLAGS: no dynamic dispatch on a
/// free-form string `handler.type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CustomToolHandlerConfig {
    /// Forward to another MCP server's tool (external collaborator).
    Mcp { server: String, tool: String },
    /// Forward to a platform-specific workflow adapter (external collaborator,
    /// e.g. Coze workflows) — out of scope per spec.md §1.
    ProxyPlatform { platform: String, workflow_id: String },
    /// Generic webhook: POST `{name, arguments}`, expect a `ToolResult`-shaped
    /// JSON body back.
    Http { url: String },
    /// An in-process function registered by the embedding application; has
    /// no wire representation and is never constructed from config.
    #[serde(skip)]
    Function,
}

/// Invariant enforced at load time: every key in `mcp_server_config` must
/// name a configured service; orphaned entries are discarded (spec.md §6).
pub fn prune_orphaned_server_overrides(config: &mut GatewayConfig) -> Vec<String> {
    let known: std::collections::HashSet<_> = config.mcp_servers.keys().cloned().collect();
    let mut removed = Vec::new();
    config.mcp_server_config.retain(|name, _| {
        let keep = known.contains(name);
        if !keep {
            removed.push(name.clone());
        }
        keep
    });
    removed.sort();
    removed
}
