use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use mcpgw_manager::CustomToolRegistry;
use mcpgw_types::{prune_orphaned_server_overrides, CustomToolEntry, CustomToolHandler, GatewayConfig, ServiceConfig};

const CONFIG_FILE_NAME: &str = "config.json";
const CONFIG_DIR_ENV: &str = "XIAOZHI_CONFIG_DIR";

/// Resolves the config file path from `--config-dir`, falling back to
/// `XIAOZHI_CONFIG_DIR` (spec.md §6). Reading any other env var to locate
/// config is explicitly out of scope.
pub fn resolve_config_path(cli_override: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match cli_override {
        Some(dir) => dir,
        None => {
            let raw = std::env::var(CONFIG_DIR_ENV)
                .with_context(|| format!("{CONFIG_DIR_ENV} is not set and --config-dir was not given"))?;
            PathBuf::from(raw)
        }
    };
    Ok(dir.join(CONFIG_FILE_NAME))
}

/// Reads and parses `GatewayConfig`, then prunes `mcpServerConfig` entries
/// that name a service absent from `mcpServers` (spec.md §6's invariant).
/// Any failure here is a configuration problem, not a startup one.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read gateway config at {}", path.display()))?;
    let mut config: GatewayConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse gateway config at {}", path.display()))?;

    let orphaned = prune_orphaned_server_overrides(&mut config);
    for name in &orphaned {
        tracing::warn!(service = %name, "discarding mcpServerConfig entry with no matching mcpServers entry");
    }

    Ok(config)
}

/// One `ServiceConfig` per configured upstream, using spec.md §3's
/// defaults: `mcpServers` in the wire config carries only the transport,
/// not a per-service timeout or reconnect override.
pub fn service_configs(config: &GatewayConfig) -> Vec<(String, ServiceConfig)> {
    config
        .mcp_servers
        .iter()
        .map(|(name, transport)| {
            (
                name.clone(),
                ServiceConfig {
                    name: name.clone(),
                    transport: transport.clone(),
                    timeout_ms: 30_000,
                    reconnect: mcpgw_types::ReconnectPolicy::default(),
                },
            )
        })
        .collect()
}

/// Builds the custom-tool side channel (spec.md §4.6) from the `customMCP`
/// block. Duplicate names are rejected outright: a registry that silently
/// kept the last write would make dispatch non-deterministic.
pub fn build_custom_tool_registry(config: &GatewayConfig) -> Result<CustomToolRegistry> {
    let Some(custom_mcp) = config.custom_mcp.as_ref() else {
        return Ok(CustomToolRegistry::new());
    };

    let entries: Vec<CustomToolEntry> = custom_mcp
        .tools
        .iter()
        .cloned()
        .map(|entry| CustomToolEntry {
            name: entry.name,
            description: entry.description,
            input_schema: entry.input_schema,
            handler: CustomToolHandler::from(entry.handler),
        })
        .collect();

    match CustomToolRegistry::from_entries(entries) {
        Ok(registry) => Ok(registry),
        Err(duplicate) => bail!("duplicate customMCP tool name '{}'", duplicate.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolve_config_path_prefers_cli_override_over_env() {
        let path = resolve_config_path(Some(PathBuf::from("/tmp/explicit"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/explicit/config.json"));
    }

    #[test]
    fn load_gateway_config_prunes_orphaned_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "mcpEndpoint": "wss://example.test/endpoint",
                "mcpServers": {{
                    "calc": {{"kind": "stdio", "command": "calc-server", "args": []}}
                }},
                "mcpServerConfig": {{
                    "calc": {{"tools": {{}}}},
                    "ghost": {{"tools": {{}}}}
                }}
            }}"#
        )
        .unwrap();

        let config = load_gateway_config(&path).unwrap();
        assert!(config.mcp_server_config.contains_key("calc"));
        assert!(!config.mcp_server_config.contains_key("ghost"));

        let services = service_configs(&config);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].0, "calc");
    }

    #[test]
    fn build_custom_tool_registry_rejects_duplicate_names() {
        let mut config = GatewayConfig::default();
        config.custom_mcp = Some(mcpgw_types::config::CustomMcpConfig {
            tools: vec![
                mcpgw_types::config::CustomToolEntryConfig {
                    name: "weather".into(),
                    description: "looks up weather".into(),
                    input_schema: serde_json::json!({"type": "object"}),
                    handler: mcpgw_types::config::CustomToolHandlerConfig::Http {
                        url: "https://example.test/weather".into(),
                    },
                },
                mcpgw_types::config::CustomToolEntryConfig {
                    name: "weather".into(),
                    description: "duplicate".into(),
                    input_schema: serde_json::json!({"type": "object"}),
                    handler: mcpgw_types::config::CustomToolHandlerConfig::Http {
                        url: "https://example.test/weather2".into(),
                    },
                },
            ],
        });

        let result = build_custom_tool_registry(&config);
        assert!(result.is_err());
    }
}
