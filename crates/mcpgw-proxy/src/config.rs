use std::time::Duration;

use mcpgw_types::{ConnectionConfig, ReconnectPolicy};

/// Everything `ProxyMCPServer` needs beyond the manager it forwards to
/// (spec.md §6 `mcpEndpoint` + `connection`).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Deadline for one `tools/call` dispatch to the manager, independent
    /// of any per-service timeout the manager itself applies (spec.md §4.5:
    /// "default 30s; for specific tool families...60s" — the per-family
    /// override is a `ServiceConfig.timeout` concern, so this is the floor).
    pub call_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl ProxyConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(60_000),
            // Unlike a single upstream MCPService, the downstream peer is
            // the device's one link to the outside world: it keeps trying
            // rather than giving up after a bounded number of attempts.
            reconnect: ReconnectPolicy {
                max_attempts: 0,
                ..ReconnectPolicy::default()
            },
            call_timeout: Duration::from_millis(30_000),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }

    /// Applies the optional `connection` block from `GatewayConfig` on top
    /// of the defaults.
    pub fn with_connection(mut self, connection: Option<&ConnectionConfig>) -> Self {
        if let Some(connection) = connection {
            self.heartbeat_interval = Duration::from_millis(connection.heartbeat_interval_ms);
            self.heartbeat_timeout = Duration::from_millis(connection.heartbeat_timeout_ms);
            self.reconnect.initial_interval_ms = connection.reconnect_interval_ms as u32;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_connection_overrides_defaults() {
        let connection = ConnectionConfig {
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
            reconnect_interval_ms: 5_000,
        };
        let config = ProxyConfig::new("wss://example.test/endpoint").with_connection(Some(&connection));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(15_000));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(45_000));
        assert_eq!(config.reconnect.initial_interval_ms, 5_000);
    }
}
