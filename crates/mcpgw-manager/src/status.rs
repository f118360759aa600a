use mcpgw_client::{ConnectionState, ServiceStatus};
use mcpgw_types::Tool;

/// Per-service status line in `getStatus()`'s output (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct ServiceSummary {
    pub name: String,
    pub state: ConnectionState,
    pub transport_kind: String,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}

impl ServiceSummary {
    pub(crate) fn from_status(name: &str, status: ServiceStatus) -> Self {
        Self {
            name: name.to_string(),
            state: status.state,
            transport_kind: status.transport_kind,
            tool_count: status.tool_count,
            last_error: status.last_error,
            reconnect_attempts: status.reconnect_attempts,
        }
    }
}

/// `getStatus()`: per-service connection status plus the total tool count
/// across every connected service.
#[derive(Debug, Clone)]
pub struct ManagerStatus {
    pub services: Vec<ServiceSummary>,
    pub total_tools: usize,
}

/// One entry of `getAllToolsMap()`, keyed externally by qualified name.
#[derive(Debug, Clone)]
pub struct AggregatedToolEntry {
    pub service_name: String,
    pub original_name: String,
    pub tool: Tool,
}
