/// Connection lifecycle states for one upstream MCP service, per spec.md
/// §4.3's reconnection state machine diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Snapshot returned by `MCPService::get_status`.
///
/// spec.md §4.3 lists `getStatus()`'s fields as `{ state, transportKind,
/// toolCount, lastError?, reconnectAttempts, connectionState }` — `state`
/// and `connectionState` name the same `ConnectionState` enum twice (the
/// distilled spec carries both names; nothing in spec.md distinguishes a
/// "state" from a "connectionState" for one service). They collapse to
/// this single `state` field rather than a duplicate field holding an
/// identical value under a second name.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub state: ConnectionState,
    pub transport_kind: String,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}
