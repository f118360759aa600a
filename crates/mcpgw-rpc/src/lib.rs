//! JSON-RPC 2.0 session layer: id correlation, notification dispatch, and
//! timeout handling on top of [`mcpgw_transport::Transport`].

mod message;
mod session;

pub use session::{JsonRpcSession, SessionEvent};
