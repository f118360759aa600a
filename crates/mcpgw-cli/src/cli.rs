use std::path::PathBuf;

use clap::Parser;

/// Thin entry point: load `GatewayConfig`, wire the manager and the
/// outbound proxy, run until `ctrl_c` (spec.md §0's CLI shape).
#[derive(Parser)]
#[command(name = "mcpgw", version, about = "MCP aggregator gateway")]
pub struct Cli {
    /// Overrides `XIAOZHI_CONFIG_DIR`; the gateway reads `<dir>/config.json`.
    #[arg(long)]
    pub config_dir: Option<PathBuf>,
}
