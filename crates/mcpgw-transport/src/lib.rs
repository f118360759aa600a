//! Wire-level transport framing for the MCP aggregator gateway.
//!
//! Four wire protocols (stdio, SSE, streamable HTTP, WebSocket) are unified
//! behind one [`Transport`] type so the JSON-RPC session layer above never
//! has to branch on which one it's talking to.

mod raw_message;
mod sse;
mod stdio;
mod streamable_http;
mod transport;
mod websocket;

pub use raw_message::RawMessage;
pub use transport::{OutboundHandle, Transport};
