use chrono::{DateTime, Utc};
use serde_json::Value;

/// Recovery guidance attached to a [`GatewayError`] kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    Manual,
    Reconnect,
    ReconnectThenRetryOnce,
    Retry,
    Surface,
    None,
}

/// The error taxonomy shared by every component of the gateway.
///
/// Each variant is one "kind" from the error table; recoverability and
/// recovery hints are derived from the variant itself rather than stored
/// as separate fields, since they never vary independently of it.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("invalid configuration for service '{service}': {message}")]
    Config { service: String, message: String },

    #[error("failed to open transport for service '{service}': {message}")]
    Connect {
        service: String,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("handshake failed for service '{service}': {message}")]
    Handshake { service: String, message: String },

    #[error("session expired for service '{service}'")]
    SessionExpired { service: String },

    #[error("operation '{operation}' on service '{service}' timed out after {elapsed_ms}ms")]
    Timeout {
        service: String,
        operation: String,
        elapsed_ms: u64,
    },

    #[error("transport to service '{service}' terminated: {message}")]
    Transport { service: String, message: String },

    #[error("tool '{tool}' not found")]
    ToolNotFound { tool: String },

    #[error("tool name '{tool}' is ambiguous across services: {candidates:?}")]
    AmbiguousToolName {
        tool: String,
        candidates: Vec<String>,
    },

    #[error("invalid params: {message}")]
    InvalidParams { message: String },

    #[error("remote error {code} from service '{service}': {message}")]
    RemoteError {
        service: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("authentication failed for service '{service}'")]
    Authentication { service: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("service '{service}' is already connected")]
    AlreadyConnected { service: String },

    #[error("service '{service}' is not connected")]
    NotConnected { service: String },
}

impl GatewayError {
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::Connect { .. }
                | GatewayError::Handshake { .. }
                | GatewayError::SessionExpired { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::Transport { .. }
                | GatewayError::RemoteError { .. }
        )
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            GatewayError::Config { .. } => RecoveryHint::Manual,
            GatewayError::Connect { .. } => RecoveryHint::Reconnect,
            GatewayError::Handshake { .. } => RecoveryHint::Reconnect,
            GatewayError::SessionExpired { .. } => RecoveryHint::ReconnectThenRetryOnce,
            GatewayError::Timeout { .. } => RecoveryHint::Retry,
            GatewayError::Transport { .. } => RecoveryHint::Reconnect,
            GatewayError::ToolNotFound { .. } => RecoveryHint::Surface,
            GatewayError::AmbiguousToolName { .. } => RecoveryHint::Surface,
            GatewayError::InvalidParams { .. } => RecoveryHint::Surface,
            GatewayError::RemoteError { .. } => RecoveryHint::Surface,
            GatewayError::Authentication { .. } => RecoveryHint::Manual,
            GatewayError::Cancelled => RecoveryHint::None,
            GatewayError::AlreadyConnected { .. } => RecoveryHint::Surface,
            GatewayError::NotConnected { .. } => RecoveryHint::Surface,
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        match self {
            GatewayError::Config { service, .. }
            | GatewayError::Connect { service, .. }
            | GatewayError::Handshake { service, .. }
            | GatewayError::SessionExpired { service }
            | GatewayError::Timeout { service, .. }
            | GatewayError::Transport { service, .. }
            | GatewayError::RemoteError { service, .. }
            | GatewayError::Authentication { service }
            | GatewayError::AlreadyConnected { service }
            | GatewayError::NotConnected { service } => Some(service),
            _ => None,
        }
    }

    /// JSON-RPC error code per spec §7's mapping table.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            GatewayError::InvalidParams { .. } => -32602,
            GatewayError::ToolNotFound { .. } | GatewayError::AmbiguousToolName { .. } => -32601,
            GatewayError::Timeout { .. } => -32002,
            GatewayError::Transport { .. } | GatewayError::NotConnected { .. } => -32001,
            _ => -32603,
        }
    }
}

/// A timestamped, optionally service-scoped occurrence of a [`GatewayError`].
///
/// Carrying the timestamp out-of-band (rather than on every variant) keeps
/// the error enum itself free of non-deterministic fields, which matters
/// for equality-style assertions in tests.
#[derive(Debug)]
pub struct ErrorEvent {
    pub error: GatewayError,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(error: GatewayError) -> Self {
        Self {
            error,
            occurred_at: Utc::now(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_expired_hints_reconnect_then_retry_once() {
        let err = GatewayError::SessionExpired {
            service: "weather".into(),
        };
        assert_eq!(err.recovery_hint(), RecoveryHint::ReconnectThenRetryOnce);
        assert!(err.recoverable());
        assert_eq!(err.service_name(), Some("weather"));
    }

    #[test]
    fn config_error_is_not_recoverable() {
        let err = GatewayError::Config {
            service: "calc".into(),
            message: "empty command".into(),
        };
        assert!(!err.recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::Manual);
    }

    #[test]
    fn jsonrpc_code_mapping_matches_spec_table() {
        assert_eq!(
            GatewayError::InvalidParams {
                message: "x".into()
            }
            .jsonrpc_code(),
            -32602
        );
        assert_eq!(
            GatewayError::ToolNotFound { tool: "x".into() }.jsonrpc_code(),
            -32601
        );
        assert_eq!(
            GatewayError::AmbiguousToolName {
                tool: "x".into(),
                candidates: vec![]
            }
            .jsonrpc_code(),
            -32601
        );
        assert_eq!(
            GatewayError::Timeout {
                service: "s".into(),
                operation: "tools/call".into(),
                elapsed_ms: 30_000
            }
            .jsonrpc_code(),
            -32002
        );
        assert_eq!(
            GatewayError::Transport {
                service: "s".into(),
                message: "eof".into()
            }
            .jsonrpc_code(),
            -32001
        );
        assert_eq!(
            GatewayError::Authentication { service: "s".into() }.jsonrpc_code(),
            -32603
        );
    }

    #[test]
    fn already_connected_and_not_connected_are_non_recoverable_surface_errors() {
        let already = GatewayError::AlreadyConnected {
            service: "weather".into(),
        };
        assert!(!already.recoverable());
        assert_eq!(already.recovery_hint(), RecoveryHint::Surface);
        assert_eq!(already.service_name(), Some("weather"));
        assert_eq!(already.jsonrpc_code(), -32603);

        let not_connected = GatewayError::NotConnected {
            service: "weather".into(),
        };
        assert!(!not_connected.recoverable());
        assert_eq!(not_connected.recovery_hint(), RecoveryHint::Surface);
        assert_eq!(not_connected.jsonrpc_code(), -32001);
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = GatewayError::ToolNotFound {
            tool: "svc__echo".into(),
        };
        assert_eq!(err.to_string(), "tool 'svc__echo' not found");
    }
}
