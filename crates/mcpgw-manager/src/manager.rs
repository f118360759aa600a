use std::collections::BTreeMap;
use std::sync::Arc;

use mcpgw_client::{ConnectionState, MCPService};
use mcpgw_types::{qualify, split_qualified, GatewayError, ServiceConfig, Tool, ToolResult};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::custom_tools::CustomToolRegistry;
use crate::events::{EventBus, ManagerEvent};
use crate::status::{AggregatedToolEntry, ManagerStatus, ServiceSummary};

struct ManagedService {
    service: Arc<MCPService>,
    /// Recomputes and broadcasts the aggregate catalog whenever this
    /// service's connection state or tool cache changes (spec.md §4.4).
    watcher: JoinHandle<()>,
}

/// Lifecycle controller and tool-name router for every configured upstream
/// MCP service (spec.md §4.4, component D).
///
/// `addServiceConfig`/`updateServiceConfig`/`removeServiceConfig` are pure
/// metadata operations over `configs`; they never touch `services`, the map
/// of actually-running [`MCPService`] instances, per spec.md's explicit
/// contract. Both maps are `BTreeMap`s under a `tokio::sync::RwLock` so
/// `getAllTools()`/`getStatus()` iterate services in a stable order and
/// readers see one consistent snapshot (spec.md §5's "single-writer,
/// multi-reader" requirement for the services map).
pub struct MCPServiceManager {
    configs: RwLock<BTreeMap<String, ServiceConfig>>,
    services: RwLock<BTreeMap<String, ManagedService>>,
    custom_tools: Arc<CustomToolRegistry>,
    events: Arc<EventBus>,
}

impl MCPServiceManager {
    pub fn new(custom_tools: CustomToolRegistry) -> Self {
        Self {
            configs: RwLock::new(BTreeMap::new()),
            services: RwLock::new(BTreeMap::new()),
            custom_tools: Arc::new(custom_tools),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Pure metadata operation; does not touch a running instance of this
    /// service, if one exists.
    pub async fn add_service_config(&self, name: &str, config: ServiceConfig) -> Result<(), GatewayError> {
        mcpgw_types::validate_service_name(name)?;
        self.configs.write().await.insert(name.to_string(), config);
        Ok(())
    }

    pub async fn update_service_config(&self, name: &str, config: ServiceConfig) -> Result<(), GatewayError> {
        self.add_service_config(name, config).await
    }

    /// Pure metadata operation; a currently-running instance keeps running
    /// under its old configuration until `stopService`/`startService` is
    /// called again.
    pub async fn remove_service_config(&self, name: &str) -> bool {
        self.configs.write().await.remove(name).is_some()
    }

    pub async fn configured_service_names(&self) -> Vec<String> {
        self.configs.read().await.keys().cloned().collect()
    }

    /// Starts (or restarts) every configured service in parallel, each on
    /// its own task so one hung handshake cannot delay the others past its
    /// own timeout (spec.md §4.4). Returns the names of services that
    /// failed to start; an empty configuration is a warning, not an error.
    ///
    /// Takes `self: &Arc<Self>` (rather than `&self`) because each
    /// per-service start runs on its own spawned `tokio` task, which
    /// requires `'static` captures — `Arc::clone(self)` gives each task
    /// its own owning handle instead of borrowing `self`'s lifetime.
    pub async fn start_all_services(self: &Arc<Self>) -> Vec<String> {
        let names: Vec<String> = self.configured_service_names().await;
        if names.is_empty() {
            tracing::warn!("start_all_services called with no configured upstream services");
            return Vec::new();
        }

        let mut joins = JoinSet::new();
        for name in names {
            let this = Arc::clone(self);
            joins.spawn(async move { (name.clone(), this.start_service(&name).await) });
        }

        let mut succeeded = 0usize;
        let mut failed = Vec::new();
        while let Some(outcome) = joins.join_next().await {
            match outcome {
                Ok((name, Ok(()))) => {
                    succeeded += 1;
                    tracing::info!(service = %name, "service started");
                }
                Ok((name, Err(error))) => {
                    tracing::warn!(service = %name, error = %error, "service failed to start");
                    failed.push(name);
                }
                Err(join_error) => {
                    tracing::warn!(error = %join_error, "service start task panicked");
                }
            }
        }
        tracing::info!(succeeded, failed = failed.len(), "start_all_services summary");
        failed
    }

    /// Starts a configured service by name: creates the [`MCPService`] if
    /// this is its first start, or reconnects it if already running
    /// ("starts or restarts", spec.md §4.4).
    pub async fn start_service(&self, name: &str) -> Result<(), GatewayError> {
        let config = self
            .configs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::Config {
                service: name.to_string(),
                message: "no configuration registered for this service name".to_string(),
            })?;

        let existing = self.services.read().await.contains_key(name);
        if existing {
            let service = {
                let services = self.services.read().await;
                services.get(name).unwrap().service.clone()
            };
            return service.reconnect().await;
        }

        let service = Arc::new(MCPService::new(config));
        let watcher = spawn_tools_watcher(service.clone(), self.events.clone());
        self.services.write().await.insert(
            name.to_string(),
            ManagedService {
                service: service.clone(),
                watcher,
            },
        );

        service.connect().await
    }

    /// Disconnects the underlying service then drops it; a subsequent
    /// `startService` creates a fresh instance.
    pub async fn stop_service(&self, name: &str) {
        let removed = self.services.write().await.remove(name);
        if let Some(managed) = removed {
            managed.watcher.abort();
            managed.service.disconnect().await;
        }
    }

    /// Parallel, best-effort shutdown of every running service. Errors are
    /// logged, never propagated (spec.md §4.4). Same `Arc<Self>` reasoning
    /// as `start_all_services`.
    pub async fn stop_all_services(self: &Arc<Self>) {
        let names: Vec<String> = self.services.read().await.keys().cloned().collect();
        let mut joins = JoinSet::new();
        for name in names {
            let this = Arc::clone(self);
            joins.spawn(async move { this.stop_service(&name).await });
        }
        while let Some(outcome) = joins.join_next().await {
            if let Err(join_error) = outcome {
                tracing::warn!(error = %join_error, "service stop task panicked");
            }
        }
    }

    /// Aggregated catalog across every running service, in a stable
    /// (service name, then upstream order) sequence.
    pub async fn get_all_tools(&self) -> Vec<Tool> {
        let services = self.services.read().await;
        services.values().flat_map(|managed| managed.service.get_tools()).collect()
    }

    /// `qualifiedName -> {serviceName, originalName, tool}`.
    pub async fn get_all_tools_map(&self) -> std::collections::HashMap<String, AggregatedToolEntry> {
        let services = self.services.read().await;
        let mut map = std::collections::HashMap::new();
        for managed in services.values() {
            for tool in managed.service.get_tools() {
                map.insert(
                    tool.qualified_name(),
                    AggregatedToolEntry {
                        service_name: tool.owning_service_name.clone(),
                        original_name: tool.original_name.clone(),
                        tool,
                    },
                );
            }
        }
        map
    }

    pub async fn get_connected_services(&self) -> Vec<String> {
        let services = self.services.read().await;
        services
            .iter()
            .filter(|(_, managed)| managed.service.is_connected())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn get_service(&self, name: &str) -> Option<Arc<MCPService>> {
        self.services.read().await.get(name).map(|managed| managed.service.clone())
    }

    pub async fn get_status(&self) -> ManagerStatus {
        let services = self.services.read().await;
        let summaries: Vec<ServiceSummary> = services
            .iter()
            .map(|(name, managed)| ServiceSummary::from_status(name, managed.service.get_status()))
            .collect();
        let total_tools = summaries.iter().map(|s| s.tool_count).sum();
        ManagerStatus {
            services: summaries,
            total_tools,
        }
    }

    pub fn has_custom_mcp_tool(&self, name: &str) -> bool {
        self.custom_tools.has_custom_tool(name)
    }

    pub fn get_custom_mcp_tools(&self) -> Vec<mcpgw_types::CustomToolEntry> {
        self.custom_tools.custom_tools().into_iter().cloned().collect()
    }

    /// Dispatches `tools/call` per spec.md §4.4's resolution algorithm:
    /// a composite `service__tool` id routes directly; a bare id resolves
    /// by searching every running service's cache, failing with
    /// `AmbiguousToolName` on more than one match, and falling back to the
    /// custom-tool registry (§4.6) only when no upstream tool matches at
    /// all.
    pub async fn call_tool(&self, id: &str, arguments: Value) -> Result<ToolResult, GatewayError> {
        if let Some((service_name, tool_name)) = split_qualified(id) {
            let service = self.get_service(service_name).await.ok_or_else(|| GatewayError::ToolNotFound {
                tool: id.to_string(),
            })?;
            return service.call_tool(tool_name, arguments).await;
        }

        let candidates = self.find_bare_name_candidates(id).await;
        match candidates.len() {
            0 => {
                if self.custom_tools.has_custom_tool(id) {
                    return self.custom_tools.call(id, &arguments).await;
                }
                Err(GatewayError::ToolNotFound { tool: id.to_string() })
            }
            1 => {
                let service = self.get_service(&candidates[0]).await.ok_or_else(|| GatewayError::ToolNotFound {
                    tool: id.to_string(),
                })?;
                service.call_tool(id, arguments).await
            }
            _ => Err(GatewayError::AmbiguousToolName {
                tool: id.to_string(),
                candidates,
            }),
        }
    }

    async fn find_bare_name_candidates(&self, tool_name: &str) -> Vec<String> {
        let services = self.services.read().await;
        services
            .iter()
            .filter(|(_, managed)| managed.service.get_tools().iter().any(|t| t.original_name == tool_name))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn spawn_tools_watcher(service: Arc<MCPService>, events: Arc<EventBus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut watch = service.watch_tools();
        loop {
            if watch.changed().await.is_err() {
                break;
            }
            events.emit(ManagerEvent::ToolsChanged);
            if watch.borrow().state == ConnectionState::Failed {
                events.emit(ManagerEvent::ServiceFailed {
                    service: service.name().to_string(),
                });
            }
        }
    })
}

/// `serviceName + "__" + toolName`, exposed for callers composing composite
/// names without constructing a [`Tool`].
pub fn qualified_tool_name(service_name: &str, tool_name: &str) -> String {
    qualify(service_name, tool_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgw_types::{ReconnectPolicy, TransportConfig};
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

    const ECHO_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"0"}}}'
      ;;
    *'"method":"tools/list"'*)
      echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"echoes","inputSchema":{"type":"object"}}]}}'
      ;;
    *'"method":"tools/call"'*)
      echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"echoed"}]}}'
      ;;
  esac
done
"#;

    fn stdio_config(name: &str, script: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            transport: TransportConfig::Stdio {
                command: "sh".into(),
                args: vec!["-c".into(), script.to_string()],
                env: StdHashMap::new(),
            },
            timeout_ms: 2_000,
            reconnect: ReconnectPolicy::default(),
        }
    }

    #[tokio::test]
    async fn start_all_services_connects_every_configured_service() {
        let manager = Arc::new(MCPServiceManager::new(CustomToolRegistry::new()));
        manager.add_service_config("calc", stdio_config("calc", ADD_SERVER_SCRIPT)).await.unwrap();
        manager.add_service_config("echoer", stdio_config("echoer", ECHO_SERVER_SCRIPT)).await.unwrap();

        let failed = manager.start_all_services().await;
        assert!(failed.is_empty());

        let tools = manager.get_all_tools().await;
        assert_eq!(tools.len(), 2);

        manager.stop_all_services().await;
    }

    #[tokio::test]
    async fn start_all_services_isolates_one_bad_config_from_the_rest() {
        let manager = Arc::new(MCPServiceManager::new(CustomToolRegistry::new()));
        manager.add_service_config("calc", stdio_config("calc", ADD_SERVER_SCRIPT)).await.unwrap();
        manager
            .add_service_config(
                "broken",
                ServiceConfig {
                    name: "broken".into(),
                    transport: TransportConfig::Stdio {
                        command: String::new(),
                        args: vec![],
                        env: StdHashMap::new(),
                    },
                    timeout_ms: 1_000,
                    reconnect: ReconnectPolicy::default(),
                },
            )
            .await
            .unwrap();

        let failed = manager.start_all_services().await;
        assert_eq!(failed, vec!["broken".to_string()]);

        let connected = manager.get_connected_services().await;
        assert_eq!(connected, vec!["calc".to_string()]);

        manager.stop_all_services().await;
    }

    #[tokio::test]
    async fn collision_requires_composite_name_and_bare_name_is_ambiguous() {
        let manager = Arc::new(MCPServiceManager::new(CustomToolRegistry::new()));
        manager.add_service_config("svc1", stdio_config("svc1", ECHO_SERVER_SCRIPT)).await.unwrap();
        manager.add_service_config("svc2", stdio_config("svc2", ECHO_SERVER_SCRIPT)).await.unwrap();
        manager.start_all_services().await;

        let bare = manager.call_tool("echo", serde_json::json!({})).await;
        assert!(matches!(bare, Err(GatewayError::AmbiguousToolName { .. })));

        let qualified = manager.call_tool("svc1__echo", serde_json::json!({})).await;
        assert!(qualified.is_ok());

        manager.stop_all_services().await;
    }

    #[tokio::test]
    async fn unmatched_bare_name_falls_back_to_custom_tool_registry() {
        let custom_entry = mcpgw_types::CustomToolEntry {
            name: "weather_lookup".into(),
            description: "looks up weather".into(),
            input_schema: serde_json::json!({"type": "object"}),
            handler: mcpgw_types::CustomToolHandler::Function(std::sync::Arc::new(|_| {
                mcpgw_types::ToolResult::text("sunny")
            })),
        };
        let registry = CustomToolRegistry::from_entries(vec![custom_entry]).unwrap();
        let manager = Arc::new(MCPServiceManager::new(registry));
        manager.add_service_config("calc", stdio_config("calc", ADD_SERVER_SCRIPT)).await.unwrap();
        manager.start_all_services().await;

        let result = manager.call_tool("weather_lookup", serde_json::json!({})).await.unwrap();
        assert_eq!(result.content.len(), 1);

        manager.stop_all_services().await;
    }

    #[tokio::test]
    async fn remove_service_config_does_not_touch_a_running_instance() {
        let manager = Arc::new(MCPServiceManager::new(CustomToolRegistry::new()));
        manager.add_service_config("calc", stdio_config("calc", ADD_SERVER_SCRIPT)).await.unwrap();
        manager.start_all_services().await;

        assert!(manager.remove_service_config("calc").await);
        assert!(manager.get_service("calc").await.is_some());
        assert!(manager.get_connected_services().await.contains(&"calc".to_string()));

        manager.stop_all_services().await;
    }

    #[tokio::test]
    async fn tools_changed_event_fires_after_start() {
        let manager = Arc::new(MCPServiceManager::new(CustomToolRegistry::new()));
        let mut events = manager.subscribe_events();
        manager.add_service_config("calc", stdio_config("calc", ADD_SERVER_SCRIPT)).await.unwrap();
        manager.start_all_services().await;

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .expect("event arrives before timeout")
            .expect("event channel stays open");
        assert!(matches!(event, ManagerEvent::ToolsChanged));

        manager.stop_all_services().await;
    }
}
