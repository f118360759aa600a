use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mcpgw_manager::MCPServiceManager;
use mcpgw_proxy::{ProxyConfig, ProxyMCPServer};

mod cli;
mod config;

use cli::Cli;

/// Exit codes per spec.md §6.
const EXIT_OK: u8 = 0;
const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_INVALID_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();

    let config_path = match config::resolve_config_path(cli.config_dir) {
        Ok(path) => path,
        Err(error) => {
            eprintln!("invalid configuration: {error:#}");
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    let gateway_config = match config::load_gateway_config(&config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid configuration: {error:#}");
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    let custom_tools = match config::build_custom_tool_registry(&gateway_config) {
        Ok(registry) => registry,
        Err(error) => {
            eprintln!("invalid configuration: {error:#}");
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    match run(gateway_config, custom_tools).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(error) => {
            eprintln!("mcpgw failed to start: {error:#}");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

async fn run(gateway_config: mcpgw_types::GatewayConfig, custom_tools: mcpgw_manager::CustomToolRegistry) -> anyhow::Result<()> {
    let manager = Arc::new(MCPServiceManager::new(custom_tools));

    let services = config::service_configs(&gateway_config);
    if services.is_empty() {
        tracing::warn!("no upstream services configured; mcpgw will idle with an empty catalog");
    }
    for (name, service_config) in services {
        if let Err(error) = manager.add_service_config(&name, service_config).await {
            tracing::warn!(service = %name, error = %error, "skipping service with invalid configuration");
        }
    }

    let failed = manager.start_all_services().await;
    if !failed.is_empty() {
        tracing::warn!(
            failed = ?failed,
            "one or more upstream services failed to start; mcpgw stays up so configuration can be corrected"
        );
    }

    let proxy = match gateway_config.mcp_endpoint.as_deref() {
        Some(endpoint) => {
            let proxy_config = ProxyConfig::new(endpoint).with_connection(gateway_config.connection.as_ref());
            let proxy = Arc::new(ProxyMCPServer::new(manager.clone(), proxy_config));
            let handle = proxy.start();
            println!("mcpgw aggregating {} upstream service(s), proxying to {endpoint}", manager.configured_service_names().await.len());
            Some((proxy, handle))
        }
        None => {
            tracing::warn!("no mcpEndpoint configured; running as a local aggregator with no outbound proxy");
            println!("mcpgw aggregating {} upstream service(s), no outbound proxy configured", manager.configured_service_names().await.len());
            None
        }
    };

    tokio::signal::ctrl_c().await.map_err(|error| anyhow::anyhow!("failed to install ctrl_c handler: {error}"))?;
    println!("shutting down");

    if let Some((proxy, handle)) = proxy {
        proxy.shutdown().await;
        handle.abort();
    }
    manager.stop_all_services().await;

    Ok(())
}
