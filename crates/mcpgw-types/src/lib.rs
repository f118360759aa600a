//! Shared data model and error taxonomy for the MCP aggregator gateway.

pub mod config;
pub mod custom_tool;
pub mod error;
pub mod name;
pub mod tool;
pub mod transport_config;

pub use config::GatewayConfig;
pub use custom_tool::{CustomToolEntry, CustomToolHandler};
pub use error::{ErrorEvent, GatewayError, RecoveryHint, Result};
pub use name::{qualify, split_qualified, validate_service_name, QUALIFIED_NAME_DELIMITER};
pub use tool::{ContentBlock, Tool, ToolResult};
pub use transport_config::{
    BackoffKind, ReconnectPolicy, ReconnectPolicyPatch, ServiceConfig, TransportConfig,
    WebsocketMode,
};
