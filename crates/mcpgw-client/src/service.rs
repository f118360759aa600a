use std::sync::Arc;
use std::time::Duration;

use mcpgw_rpc::{JsonRpcSession, SessionEvent};
use mcpgw_transport::Transport;
use mcpgw_types::{GatewayError, ReconnectPolicy, ReconnectPolicyPatch, ServiceConfig, Tool, ToolResult};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::state::{ConnectionState, ServiceStatus};

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "mcpgw-client";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const COMMAND_QUEUE_CAPACITY: usize = 32;

/// Transport-abstracted client for one upstream MCP server.
///
/// `connect`/`disconnect`/`reconnect` and all policy controls are
/// serialized through a single background actor task (spec.md §5's
/// "per-service mutex" is realized as that task's message loop, not an
/// explicit `Mutex`). `call_tool` deliberately bypasses the actor and talks
/// to the current session snapshot directly, so multiple tool calls can be
/// in flight concurrently even while the actor is otherwise idle.
pub struct MCPService {
    config: ServiceConfig,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    tools_watch: watch::Receiver<ServiceSnapshot>,
}

#[derive(Clone)]
struct Snapshot {
    state: ConnectionState,
    session: Option<Arc<JsonRpcSession>>,
    tools: Arc<Vec<Tool>>,
    last_error: Option<String>,
    reconnect_attempts: u32,
}

/// The slice of a service's state the manager needs to know when to
/// recompute its aggregate tool catalog (spec.md §4.4 "tool-cache
/// refresh...after each per-service connect()"), without exposing the
/// session handle `Snapshot` carries internally.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub state: ConnectionState,
    pub tools: Arc<Vec<Tool>>,
}

enum Command {
    Connect(oneshot::Sender<Result<(), GatewayError>>),
    Disconnect(oneshot::Sender<()>),
    Reconnect(oneshot::Sender<Result<(), GatewayError>>),
    EnableReconnect,
    DisableReconnect,
    UpdateReconnectOptions(ReconnectPolicyPatch),
    ResetReconnectState,
    TransportLost(u64, GatewayError),
    ScheduledReconnectFire(u64, u32),
    UpstreamToolsChanged(u64),
}

impl MCPService {
    pub fn new(config: ServiceConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let initial = Snapshot {
            state: ConnectionState::Disconnected,
            session: None,
            tools: Arc::new(Vec::new()),
            last_error: None,
            reconnect_attempts: 0,
        };
        let (publish, snapshot) = watch::channel(initial);
        let (publish_tools, tools_watch) = watch::channel(ServiceSnapshot {
            state: ConnectionState::Disconnected,
            tools: Arc::new(Vec::new()),
        });

        let actor = Actor {
            name: config.name.clone(),
            config: config.clone(),
            state: ConnectionState::Disconnected,
            session: None,
            tools: Arc::new(Vec::new()),
            manually_disconnected: false,
            policy: config.reconnect,
            reconnect_attempts: 0,
            last_error: None,
            generation: 0,
            publish,
            publish_tools,
            commands_tx: commands_tx.clone(),
            event_pump: None,
        };
        tokio::spawn(actor.run(commands_rx));

        Self {
            config,
            commands: commands_tx,
            snapshot,
            tools_watch,
        }
    }

    /// A watch channel that updates whenever this service's connection
    /// state or tool cache changes. The manager (component D) subscribes to
    /// this across every service it owns to know when to recompute its
    /// aggregate catalog, rather than polling `get_tools()` on a timer.
    pub fn watch_tools(&self) -> watch::Receiver<ServiceSnapshot> {
        self.tools_watch.clone()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Opens the transport, performs the MCP handshake, and populates the
    /// tool cache. Fails with `AlreadyConnected` if already Connected.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Connect(tx)).await?;
        rx.await.map_err(|_| self.actor_gone())?
    }

    /// Always succeeds; sets `manuallyDisconnected` so no reconnect is
    /// scheduled behind the caller's back.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Tears down the current session (if any) and re-runs `connect()`
    /// immediately, without setting `manuallyDisconnected`.
    pub async fn reconnect(&self) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reconnect(tx)).await?;
        rx.await.map_err(|_| self.actor_gone())?
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().state == ConnectionState::Connected
    }

    /// Ordered snapshot of the tool cache; empty when not Connected.
    pub fn get_tools(&self) -> Vec<Tool> {
        let snapshot = self.snapshot.borrow();
        if snapshot.state == ConnectionState::Connected {
            (*snapshot.tools).clone()
        } else {
            Vec::new()
        }
    }

    pub fn get_status(&self) -> ServiceStatus {
        let snapshot = self.snapshot.borrow();
        ServiceStatus {
            state: snapshot.state,
            transport_kind: self.config.transport.label().to_string(),
            tool_count: snapshot.tools.len(),
            last_error: snapshot.last_error.clone(),
            reconnect_attempts: snapshot.reconnect_attempts,
        }
    }

    pub async fn enable_reconnect(&self) {
        let _ = self.commands.send(Command::EnableReconnect).await;
    }

    pub async fn disable_reconnect(&self) {
        let _ = self.commands.send(Command::DisableReconnect).await;
    }

    pub async fn update_reconnect_options(&self, patch: ReconnectPolicyPatch) {
        let _ = self
            .commands
            .send(Command::UpdateReconnectOptions(patch))
            .await;
    }

    pub async fn reset_reconnect_state(&self) {
        let _ = self.commands.send(Command::ResetReconnectState).await;
    }

    /// Dispatches `tools/call`. On a `RemoteError` whose message matches the
    /// session-expiry pattern, drives one `reconnect()` and retries exactly
    /// once (spec.md §4.3 step 4) — never loops beyond that single retry.
    pub async fn call_tool(&self, original_name: &str, arguments: Value) -> Result<ToolResult, GatewayError> {
        let mut retried = false;
        loop {
            let snapshot = self.snapshot.borrow().clone();
            if snapshot.state != ConnectionState::Connected {
                return Err(GatewayError::NotConnected {
                    service: self.config.name.clone(),
                });
            }
            let Some(session) = snapshot.session.clone() else {
                return Err(GatewayError::NotConnected {
                    service: self.config.name.clone(),
                });
            };
            if !snapshot.tools.iter().any(|t| t.original_name.as_str() == original_name) {
                return Err(GatewayError::ToolNotFound {
                    tool: original_name.to_string(),
                });
            }

            let params = json!({ "name": original_name, "arguments": arguments.clone() });
            match session.call("tools/call", params, self.config.timeout()).await {
                Ok(value) => {
                    return serde_json::from_value(value).map_err(|e| GatewayError::Transport {
                        service: self.config.name.clone(),
                        message: format!("malformed tools/call result: {e}"),
                    });
                }
                Err(GatewayError::RemoteError { message, .. })
                    if !retried && looks_like_session_expired(&message) =>
                {
                    retried = true;
                    self.reconnect().await?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, command: Command) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.actor_gone())
    }

    fn actor_gone(&self) -> GatewayError {
        GatewayError::Transport {
            service: self.config.name.clone(),
            message: "service actor task has stopped".into(),
        }
    }
}

fn looks_like_session_expired(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("session") && lower.contains("expired")
}

struct Actor {
    name: String,
    config: ServiceConfig,
    state: ConnectionState,
    session: Option<Arc<JsonRpcSession>>,
    tools: Arc<Vec<Tool>>,
    manually_disconnected: bool,
    policy: ReconnectPolicy,
    reconnect_attempts: u32,
    last_error: Option<String>,
    /// Bumped on every connect/disconnect/reconnect so a scheduled reconnect
    /// timer or event-pump signal from a superseded session is ignored.
    generation: u64,
    publish: watch::Sender<Snapshot>,
    publish_tools: watch::Sender<ServiceSnapshot>,
    commands_tx: mpsc::Sender<Command>,
    event_pump: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        self.teardown_session().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.on_connect(reply).await,
            Command::Disconnect(reply) => self.on_disconnect(reply).await,
            Command::Reconnect(reply) => self.on_reconnect(reply).await,
            Command::EnableReconnect => {
                self.policy.enabled = true;
            }
            Command::DisableReconnect => {
                self.policy.enabled = false;
            }
            Command::UpdateReconnectOptions(patch) => {
                self.policy = self.policy.merged_with(patch);
            }
            Command::ResetReconnectState => self.on_reset_reconnect_state(),
            Command::TransportLost(generation, error) => self.on_transport_lost(generation, error).await,
            Command::ScheduledReconnectFire(generation, attempt) => {
                self.on_scheduled_reconnect_fire(generation, attempt).await
            }
            Command::UpstreamToolsChanged(generation) => self.on_upstream_tools_changed(generation).await,
        }
    }

    async fn on_connect(&mut self, reply: oneshot::Sender<Result<(), GatewayError>>) {
        if self.state == ConnectionState::Connected {
            let _ = reply.send(Err(GatewayError::AlreadyConnected {
                service: self.name.clone(),
            }));
            return;
        }

        self.teardown_session().await;
        self.manually_disconnected = false;
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.publish();

        self.attempt_handshake(reply).await;
    }

    async fn on_reconnect(&mut self, reply: oneshot::Sender<Result<(), GatewayError>>) {
        self.teardown_session().await;
        self.manually_disconnected = false;
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.publish();

        self.attempt_handshake(reply).await;
    }

    async fn attempt_handshake(&mut self, reply: oneshot::Sender<Result<(), GatewayError>>) {
        let generation = self.generation;
        match handshake(&self.name, &self.config).await {
            Ok((session, tools)) => {
                self.tools = Arc::new(tools);
                self.session = Some(session.clone());
                self.reconnect_attempts = 0;
                self.last_error = None;
                self.state = ConnectionState::Connected;
                self.publish();
                self.event_pump = Some(spawn_event_pump(
                    session,
                    self.commands_tx.clone(),
                    self.name.clone(),
                    generation,
                ));
                let _ = reply.send(Ok(()));
            }
            Err(error) => {
                self.last_error = Some(error.to_string());
                self.state = ConnectionState::Failed;
                self.publish();
                let _ = reply.send(Err(error));
            }
        }
    }

    async fn on_disconnect(&mut self, reply: oneshot::Sender<()>) {
        self.manually_disconnected = true;
        self.generation += 1;
        self.teardown_session().await;
        self.tools = Arc::new(Vec::new());
        self.reconnect_attempts = 0;
        self.last_error = None;
        self.state = ConnectionState::Disconnected;
        self.publish();
        let _ = reply.send(());
    }

    async fn on_transport_lost(&mut self, generation: u64, error: GatewayError) {
        if generation != self.generation || self.manually_disconnected {
            return;
        }
        self.session = None;
        self.last_error = Some(error.to_string());

        if !self.policy.allows_attempt(0) {
            self.state = ConnectionState::Failed;
            self.publish();
            return;
        }

        self.state = ConnectionState::Reconnecting;
        self.reconnect_attempts = 0;
        self.publish();
        self.schedule_attempt(1);
    }

    async fn on_scheduled_reconnect_fire(&mut self, generation: u64, attempt: u32) {
        if generation != self.generation || self.state != ConnectionState::Reconnecting {
            return;
        }

        match handshake(&self.name, &self.config).await {
            Ok((session, tools)) => {
                self.tools = Arc::new(tools);
                self.session = Some(session.clone());
                self.reconnect_attempts = 0;
                self.last_error = None;
                self.state = ConnectionState::Connected;
                self.publish();
                self.event_pump = Some(spawn_event_pump(
                    session,
                    self.commands_tx.clone(),
                    self.name.clone(),
                    generation,
                ));
            }
            Err(error) => {
                self.reconnect_attempts = attempt;
                self.last_error = Some(error.to_string());
                if self.policy.allows_attempt(attempt) {
                    self.publish();
                    self.schedule_attempt(attempt + 1);
                } else {
                    self.state = ConnectionState::Failed;
                    self.publish();
                }
            }
        }
    }

    async fn on_upstream_tools_changed(&mut self, generation: u64) {
        if generation != self.generation || self.state != ConnectionState::Connected {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        match session.call("tools/list", Value::Null, self.config.timeout()).await {
            Ok(value) => match parse_tools(&self.name, &value) {
                Ok(tools) => {
                    self.tools = Arc::new(tools);
                    self.publish();
                }
                Err(error) => {
                    tracing::warn!(service = %self.name, error = %error, "malformed tools/list refresh after list_changed notification");
                }
            },
            Err(error) => {
                tracing::warn!(service = %self.name, error = %error, "tools/list refresh failed after list_changed notification");
            }
        }
    }

    fn on_reset_reconnect_state(&mut self) {
        self.reconnect_attempts = 0;
        if self.state == ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
        self.publish();
    }

    fn schedule_attempt(&self, attempt: u32) {
        let delay = jittered_delay(&self.policy, attempt);
        let commands = self.commands_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands
                .send(Command::ScheduledReconnectFire(generation, attempt))
                .await;
        });
    }

    async fn teardown_session(&mut self) {
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }
        if let Some(session) = self.session.take() {
            session.shutdown().await;
        }
    }

    fn publish(&self) {
        let _ = self.publish.send(Snapshot {
            state: self.state,
            session: self.session.clone(),
            tools: self.tools.clone(),
            last_error: self.last_error.clone(),
            reconnect_attempts: self.reconnect_attempts,
        });
        self.publish_tools.send_if_modified(|current| {
            if current.state == self.state && current.tools == self.tools {
                return false;
            }
            current.state = self.state;
            current.tools = self.tools.clone();
            true
        });
    }
}

fn jittered_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay(attempt);
    if !policy.jitter {
        return base;
    }
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis(((base.as_millis() as f64) * factor) as u64)
}

fn spawn_event_pump(
    session: Arc<JsonRpcSession>,
    commands: mpsc::Sender<Command>,
    service: String,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match session.next_event().await {
                Some(SessionEvent::Closed { cause }) => {
                    let error = cause.unwrap_or_else(|| GatewayError::Transport {
                        service: service.clone(),
                        message: "transport closed".into(),
                    });
                    let _ = commands.send(Command::TransportLost(generation, error)).await;
                    break;
                }
                Some(SessionEvent::Notification { method, .. }) if method == "notifications/tools/list_changed" => {
                    let _ = commands.send(Command::UpstreamToolsChanged(generation)).await;
                }
                Some(_) => {}
                None => break,
            }
        }
    })
}

/// Runs the handshake algorithm from spec.md §4.3 steps 1-4 (step 5,
/// transitioning to Connected and resetting `reconnectAttempts`, is the
/// caller's responsibility since it also owns state publication).
async fn handshake(name: &str, config: &ServiceConfig) -> Result<(Arc<JsonRpcSession>, Vec<Tool>), GatewayError> {
    let timeout = config.timeout();
    let transport = Transport::open(name, &config.transport, timeout, CancellationToken::new()).await?;
    let session = Arc::new(JsonRpcSession::new(name, transport));

    let init_params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
    });
    session
        .call("initialize", init_params, timeout)
        .await
        .map_err(|e| wrap_handshake_step(name, e))?;

    session.notify("notifications/initialized", Value::Null).await?;

    let tools_response = session
        .call("tools/list", Value::Null, timeout)
        .await
        .map_err(|e| wrap_handshake_step(name, e))?;
    let tools = parse_tools(name, &tools_response)?;

    Ok((session, tools))
}

fn wrap_handshake_step(service: &str, error: GatewayError) -> GatewayError {
    match error {
        GatewayError::Timeout { .. } | GatewayError::Config { .. } | GatewayError::Connect { .. } => error,
        other => GatewayError::Handshake {
            service: service.to_string(),
            message: other.to_string(),
        },
    }
}

fn parse_tools(service: &str, response: &Value) -> Result<Vec<Tool>, GatewayError> {
    let raw_tools = response
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Handshake {
            service: service.to_string(),
            message: "tools/list response missing 'tools' array".into(),
        })?;

    let mut tools = Vec::with_capacity(raw_tools.len());
    for entry in raw_tools {
        let original_name = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Handshake {
                service: service.to_string(),
                message: "tool entry missing 'name'".into(),
            })?
            .to_string();
        let description = entry
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let input_schema = entry
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| json!({ "type": "object" }));
        tools.push(Tool {
            original_name,
            description,
            input_schema,
            owning_service_name: service.to_string(),
        });
    }
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgw_types::TransportConfig;
    use std::collections::HashMap;

    /// A stateless stdio mock: request ids are hardcoded because a fresh
    /// `JsonRpcSession` always assigns 1, 2, 3, ... to the calls this client
    /// issues during one handshake (`initialize`, `tools/list`, then the
    /// first `tools/call`).
    const ADD_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"0"}}}'
      ;;
    *'"method":"tools/list"'*)
      echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"add","description":"adds two numbers","inputSchema":{"type":"object"}}]}}'
      ;;
    *'"method":"tools/call"'*)
      echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"8"}]}}'
      ;;
  esac
done
"#;

    fn mock_service(name: &str, script: &str) -> MCPService {
        let config = ServiceConfig {
            name: name.to_string(),
            transport: TransportConfig::Stdio {
                command: "sh".into(),
                args: vec!["-c".into(), script.to_string()],
                env: HashMap::new(),
            },
            timeout_ms: 2_000,
            reconnect: ReconnectPolicy::default(),
        };
        MCPService::new(config)
    }

    #[tokio::test]
    async fn connect_performs_handshake_and_populates_tools() {
        let service = mock_service("calc", ADD_SERVER_SCRIPT);
        service.connect().await.expect("connect succeeds");

        assert!(service.is_connected());
        let tools = service.get_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].original_name, "add");
        assert_eq!(tools[0].owning_service_name, "calc");

        service.disconnect().await;
    }

    #[tokio::test]
    async fn call_tool_dispatches_and_returns_result() {
        let service = mock_service("calc", ADD_SERVER_SCRIPT);
        service.connect().await.expect("connect succeeds");

        let result = service
            .call_tool("add", json!({"a": 5, "b": 3}))
            .await
            .expect("call succeeds");
        assert!(!result.is_error);
        assert_eq!(result.content.len(), 1);

        service.disconnect().await;
    }

    #[tokio::test]
    async fn call_tool_before_connect_fails_not_connected() {
        let service = mock_service("calc", ADD_SERVER_SCRIPT);
        let result = service.call_tool("add", json!({})).await;
        assert!(matches!(result, Err(GatewayError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn call_tool_unknown_name_fails_tool_not_found() {
        let service = mock_service("calc", ADD_SERVER_SCRIPT);
        service.connect().await.expect("connect succeeds");

        let result = service.call_tool("subtract", json!({})).await;
        assert!(matches!(result, Err(GatewayError::ToolNotFound { .. })));

        service.disconnect().await;
    }

    #[tokio::test]
    async fn connect_when_already_connected_fails() {
        let service = mock_service("calc", ADD_SERVER_SCRIPT);
        service.connect().await.expect("connect succeeds");

        let result = service.connect().await;
        assert!(matches!(result, Err(GatewayError::AlreadyConnected { .. })));

        service.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_then_connect_matches_a_single_connect() {
        let service = mock_service("calc", ADD_SERVER_SCRIPT);
        service.connect().await.expect("first connect succeeds");
        service.disconnect().await;
        assert!(!service.is_connected());
        assert!(service.get_tools().is_empty());

        service.connect().await.expect("second connect succeeds");
        assert!(service.is_connected());
        assert_eq!(service.get_tools().len(), 1);

        service.disconnect().await;
    }

    #[tokio::test]
    async fn reconnect_tears_down_and_reestablishes_without_setting_manually_disconnected() {
        let service = mock_service("calc", ADD_SERVER_SCRIPT);
        service.connect().await.expect("connect succeeds");

        service.reconnect().await.expect("reconnect succeeds");
        assert!(service.is_connected());
        assert_eq!(service.get_tools().len(), 1);

        service.disconnect().await;
    }

    #[tokio::test]
    async fn watch_tools_observes_the_connect_transition() {
        let service = mock_service("calc", ADD_SERVER_SCRIPT);
        let mut watch = service.watch_tools();
        assert_eq!(watch.borrow().state, ConnectionState::Disconnected);

        service.connect().await.expect("connect succeeds");
        watch.changed().await.expect("watch channel still open");
        assert_eq!(watch.borrow().state, ConnectionState::Connected);
        assert_eq!(watch.borrow().tools.len(), 1);

        service.disconnect().await;
    }

    #[tokio::test]
    async fn status_reports_transport_kind_and_tool_count() {
        let service = mock_service("calc", ADD_SERVER_SCRIPT);
        service.connect().await.expect("connect succeeds");

        let status = service.get_status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.transport_kind, "stdio");
        assert_eq!(status.tool_count, 1);

        service.disconnect().await;
    }
}
