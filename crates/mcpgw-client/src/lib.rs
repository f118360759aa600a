//! Transport-abstracted MCP client: handshake, the per-service reconnection
//! state machine, and session-expiry recovery (spec.md §4.3).

mod service;
mod state;

pub use service::{MCPService, ServiceSnapshot};
pub use state::{ConnectionState, ServiceStatus};
