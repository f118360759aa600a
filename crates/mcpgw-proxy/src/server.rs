use std::sync::Arc;
use std::time::{Duration, Instant};

use mcpgw_manager::{MCPServiceManager, ManagerEvent};
use mcpgw_rpc::{JsonRpcSession, SessionEvent};
use mcpgw_transport::Transport;
use mcpgw_types::{GatewayError, ReconnectPolicy, ToolResult, TransportConfig, WebsocketMode};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::metrics::{MetricsSnapshot, ProxyMetrics};
use crate::protocol;

/// The downstream link's own connection state, distinct from any upstream
/// [`mcpgw_client`]-owned service state (spec.md §4.5's connection
/// lifecycle is its own state machine, not shared with component C/D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Outbound WebSocket proxy serving the MCP server role to a remote peer
/// (spec.md §4.5, component E). Owns a single persistent connection whose
/// lifetime spans many physical sockets; only explicit [`shutdown`] disposes
/// of it.
///
/// [`shutdown`]: ProxyMCPServer::shutdown
pub struct ProxyMCPServer {
    manager: Arc<MCPServiceManager>,
    config: ProxyConfig,
    metrics: Arc<ProxyMetrics>,
    publish_state: watch::Sender<ProxyConnectionState>,
    state: watch::Receiver<ProxyConnectionState>,
    cancel: CancellationToken,
}

impl ProxyMCPServer {
    pub fn new(manager: Arc<MCPServiceManager>, config: ProxyConfig) -> Self {
        let (publish_state, state) = watch::channel(ProxyConnectionState::Disconnected);
        Self {
            manager,
            config,
            metrics: Arc::new(ProxyMetrics::new()),
            publish_state,
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn connection_state(&self) -> ProxyConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProxyConnectionState> {
        self.state.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cancels the reconnect loop and any in-flight session; idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Spawns the connect/serve/reconnect loop. Takes `self: &Arc<Self>`
    /// since the loop runs on a detached `'static` task for the life of the
    /// process, the same reasoning as `MCPServiceManager::start_all_services`.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_forever().await })
    }

    async fn run_forever(self: Arc<Self>) {
        let mut attempts_made: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(ProxyConnectionState::Connecting);
            match self.connect_once().await {
                Ok(session) => {
                    attempts_made = 0;
                    self.set_state(ProxyConnectionState::Connected);
                    tracing::info!(endpoint = %self.config.endpoint, "proxy connected to remote endpoint");
                    self.serve_session(&session).await;
                    session.shutdown().await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.set_state(ProxyConnectionState::Reconnecting);
                }
                Err(error) => {
                    tracing::warn!(error = %error, attempts_made, "proxy failed to connect to remote endpoint");
                }
            }

            if !self.config.reconnect.allows_attempt(attempts_made) {
                self.set_state(ProxyConnectionState::Failed);
                tracing::error!("proxy exhausted reconnect attempts to remote endpoint; giving up");
                break;
            }
            attempts_made += 1;

            let delay = jittered_delay(&self.config.reconnect, attempts_made);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        self.set_state(ProxyConnectionState::Disconnected);
    }

    async fn connect_once(&self) -> Result<Arc<JsonRpcSession>, GatewayError> {
        let transport_config = TransportConfig::Websocket {
            url: self.config.endpoint.clone(),
            mode: WebsocketMode::Client,
            reconnect: None,
        };
        let transport = Transport::open(
            "proxy",
            &transport_config,
            self.config.connect_timeout,
            self.cancel.clone(),
        )
        .await?;
        Ok(Arc::new(JsonRpcSession::new("proxy", transport)))
    }

    /// Drives one physical connection until it closes: answers inbound
    /// requests, forwards `tools-changed` as a list-change notification,
    /// and keeps the JSON-RPC heartbeat alive.
    async fn serve_session(self: &Arc<Self>, session: &Arc<JsonRpcSession>) {
        let heartbeat = self.spawn_heartbeat(session.clone());
        let mut manager_events = self.manager.subscribe_events();

        loop {
            tokio::select! {
                event = session.next_event() => {
                    match event {
                        Some(SessionEvent::Request { id, method, params }) => {
                            self.handle_request(session, id, method, params).await;
                        }
                        Some(SessionEvent::Notification { .. }) => {}
                        Some(SessionEvent::ParseError { raw, detail }) => {
                            tracing::debug!(detail = %detail, "malformed inbound message from remote endpoint");
                            if let Some(id) = protocol::extract_id_from_malformed(&raw) {
                                let _ = session.respond_err(id, -32700, "parse error".to_string(), None).await;
                            }
                        }
                        Some(SessionEvent::Closed { cause }) => {
                            if let Some(cause) = cause {
                                tracing::warn!(error = %cause, "proxy connection to remote endpoint lost");
                            }
                            break;
                        }
                        None => break,
                    }
                }
                event = manager_events.recv() => {
                    match event {
                        Ok(ManagerEvent::ToolsChanged) => {
                            if self.connection_state() == ProxyConnectionState::Connected {
                                let _ = session.notify("notifications/tools/list_changed", Value::Null).await;
                            }
                        }
                        Ok(ManagerEvent::ServiceFailed { service }) => {
                            tracing::warn!(service = %service, "upstream service failed; aggregate catalog may have shrunk");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "proxy missed manager events; catalog notifications may be stale");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                    }
                }
            }
        }

        heartbeat.abort();
    }

    async fn handle_request(self: &Arc<Self>, session: &Arc<JsonRpcSession>, id: Value, method: String, params: Value) {
        // A missing or null id is rejected before any handler runs
        // (spec.md §4.2); `message::classify` already normalizes an absent
        // `id` member to `Value::Null`, so this one check covers both.
        if id.is_null() {
            let _ = session
                .respond_err(Value::Null, -32602, "request id must not be null".to_string(), None)
                .await;
            return;
        }

        match method.as_str() {
            "initialize" => {
                let _ = session.respond_ok(id, protocol::initialize_result()).await;
            }
            "tools/list" => {
                let tools = self.manager.get_all_tools().await;
                let _ = session.respond_ok(id, protocol::tools_list_result(&tools)).await;
            }
            "tools/call" => self.handle_tool_call(session, id, params).await,
            "ping" => {
                let _ = session.respond_ok(id, json!({})).await;
            }
            "resources/list" => {
                let _ = session.respond_ok(id, json!({"resources": []})).await;
            }
            _ => {
                let _ = session
                    .respond_err(id, -32601, format!("method not found: {method}"), None)
                    .await;
            }
        }
    }

    async fn handle_tool_call(self: &Arc<Self>, session: &Arc<JsonRpcSession>, id: Value, params: Value) {
        let (name, arguments) = match protocol::parse_call_params(&params) {
            Ok(parsed) => parsed,
            Err(error) => {
                let _ = session
                    .respond_err(id, error.jsonrpc_code(), error.to_string(), None)
                    .await;
                return;
            }
        };

        match self.call_tool_with_retry(&name, arguments).await {
            Ok(result) => {
                let _ = session.respond_ok(id, protocol::tool_result_to_value(&result)).await;
            }
            Err(error) => {
                let data = json!({ "category": error_category(&error) });
                let _ = session
                    .respond_err(id, error.jsonrpc_code(), error.to_string(), Some(data))
                    .await;
            }
        }
    }

    /// Retries retriable errors (`Timeout`, `Transport`) up to
    /// `retryAttempts` with a small fixed backoff; everything else fails on
    /// the first attempt (spec.md §4.5).
    async fn call_tool_with_retry(&self, name: &str, arguments: Value) -> Result<ToolResult, GatewayError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.config.call_timeout, self.manager.call_tool(name, arguments.clone())).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout {
                    service: "proxy".to_string(),
                    operation: "tools/call".to_string(),
                    elapsed_ms: self.config.call_timeout.as_millis() as u64,
                }),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(result) => {
                    self.metrics.record_call(name, true, elapsed_ms);
                    return Ok(result);
                }
                Err(error) if is_retriable(&error) && attempt < self.config.retry_attempts => {
                    tracing::debug!(tool = %name, attempt, error = %error, "retrying tool call");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(error) => {
                    self.metrics.record_call(name, false, elapsed_ms);
                    return Err(error);
                }
            }
        }
    }

    fn spawn_heartbeat(&self, session: Arc<JsonRpcSession>) -> JoinHandle<()> {
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if session.notify("ping", Value::Null).await.is_err() {
                    break;
                }
            }
        })
    }

    fn set_state(&self, state: ProxyConnectionState) {
        self.publish_state.send_replace(state);
    }
}

fn is_retriable(error: &GatewayError) -> bool {
    matches!(error, GatewayError::Timeout { .. } | GatewayError::Transport { .. })
}

fn error_category(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::Config { .. } => "ConfigError",
        GatewayError::Connect { .. } => "ConnectError",
        GatewayError::Handshake { .. } => "HandshakeError",
        GatewayError::SessionExpired { .. } => "SessionExpired",
        GatewayError::Timeout { .. } => "Timeout",
        GatewayError::Transport { .. } => "Transport",
        GatewayError::ToolNotFound { .. } => "ToolNotFound",
        GatewayError::AmbiguousToolName { .. } => "AmbiguousToolName",
        GatewayError::InvalidParams { .. } => "InvalidParams",
        GatewayError::RemoteError { .. } => "RemoteError",
        GatewayError::Authentication { .. } => "Authentication",
        GatewayError::Cancelled => "Cancelled",
        GatewayError::AlreadyConnected { .. } => "AlreadyConnected",
        GatewayError::NotConnected { .. } => "NotConnected",
    }
}

/// Same jitter shape as `mcpgw-client`'s reconnect loop (spec.md §4.5:
/// "bounded attempts, exponential with jitter by default").
fn jittered_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay(attempt);
    if !policy.jitter {
        return base;
    }
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis(((base.as_millis() as f64) * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgw_manager::CustomToolRegistry;
    use mcpgw_types::ServiceConfig;
    use std::collections::HashMap as StdHashMap;

    const ADD_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"0"}}}'
      ;;
    *'"method":"tools/list"'*)
      echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"add","description":"adds","inputSchema":{"type":"object"}}]}}'
      ;;
    *'"method":"tools/call"'*)
      echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"8"}]}}'
      ;;
  esac
done
"#;

    async fn manager_with_calc() -> Arc<MCPServiceManager> {
        let manager = Arc::new(MCPServiceManager::new(CustomToolRegistry::new()));
        manager
            .add_service_config(
                "calc",
                ServiceConfig {
                    name: "calc".into(),
                    transport: TransportConfig::Stdio {
                        command: "sh".into(),
                        args: vec!["-c".into(), ADD_SERVER_SCRIPT.into()],
                        env: StdHashMap::new(),
                    },
                    timeout_ms: 2_000,
                    reconnect: Default::default(),
                },
            )
            .await
            .unwrap();
        manager.start_all_services().await;
        manager
    }

    #[tokio::test]
    async fn initialize_tools_list_and_tools_call_round_trip_over_the_real_websocket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let stream = tokio_tungstenite::accept_async(tcp).await.unwrap();
            stream
        });

        let manager = manager_with_calc().await;
        let proxy = Arc::new(ProxyMCPServer::new(
            manager.clone(),
            ProxyConfig::new(format!("ws://{addr}")),
        ));
        let proxy_handle = proxy.start();

        let server_stream = server_task.await.unwrap();
        let (mut write, mut read) = futures_util::StreamExt::split(server_stream);

        send_json(&mut write, json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}})).await;
        let response = recv_json(&mut read).await;
        assert_eq!(response["result"]["protocolVersion"], json!("2024-11-05"));

        send_json(&mut write, json!({"jsonrpc":"2.0","id":2,"method":"tools/list","params":{}})).await;
        let response = recv_json(&mut read).await;
        assert_eq!(response["result"]["tools"][0]["name"], json!("calc__add"));

        send_json(
            &mut write,
            json!({"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"calc__add","arguments":{}}}),
        )
        .await;
        let response = recv_json(&mut read).await;
        assert_eq!(response["result"]["content"][0]["text"], json!("8"));

        send_json(&mut write, json!({"jsonrpc":"2.0","id":4,"method":"ping","params":{}})).await;
        let response = recv_json(&mut read).await;
        assert_eq!(response["result"], json!({}));

        send_json(&mut write, json!({"jsonrpc":"2.0","id":5,"method":"unsupported","params":{}})).await;
        let response = recv_json(&mut read).await;
        assert_eq!(response["error"]["code"], json!(-32601));

        send_json(&mut write, json!({"jsonrpc":"2.0","id":6,"method":"resources/list","params":{}})).await;
        let response = recv_json(&mut read).await;
        assert_eq!(response["result"], json!({"resources": []}));

        send_json(&mut write, json!({"jsonrpc":"2.0","id":null,"method":"ping","params":{}})).await;
        let response = recv_json(&mut read).await;
        assert_eq!(response["error"]["code"], json!(-32602));
        assert_eq!(response["id"], Value::Null);

        send_json(
            &mut write,
            json!({"jsonrpc":"2.0","id":null,"method":"tools/call","params":{"name":"calc__add","arguments":{}}}),
        )
        .await;
        let response = recv_json(&mut read).await;
        assert_eq!(response["error"]["code"], json!(-32602));
        assert_eq!(response["id"], Value::Null);

        let snapshot = proxy.metrics();
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.successful_calls, 1);

        proxy.shutdown().await;
        proxy_handle.abort();
        manager.stop_all_services().await;
    }

    async fn send_json(
        write: &mut futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
            tokio_tungstenite::tungstenite::Message,
        >,
        value: Value,
    ) {
        use futures_util::SinkExt;
        write
            .send(tokio_tungstenite::tungstenite::Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn recv_json(
        read: &mut futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>>,
    ) -> Value {
        use futures_util::StreamExt;
        loop {
            match read.next().await.unwrap().unwrap() {
                tokio_tungstenite::tungstenite::Message::Text(text) => {
                    return serde_json::from_str(&text).unwrap();
                }
                _ => continue,
            }
        }
    }
}
