//! Outbound WebSocket proxy serving the MCP server role to a remote peer
//! (spec.md §4.5, component E).
//!
//! `ProxyMCPServer` dials `mcpEndpoint` as a WebSocket client and then acts
//! as the JSON-RPC *server* for that connection: it answers `initialize`,
//! `tools/list`, `tools/call`, and `ping`, forwards the manager's
//! aggregate-catalog changes as `notifications/tools/list_changed`, and
//! keeps the link alive with a heartbeat independent of reconnect.

mod config;
mod metrics;
mod protocol;
mod server;

pub use config::ProxyConfig;
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use server::{ProxyConnectionState, ProxyMCPServer};
