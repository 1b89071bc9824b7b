//! MCP server binary: exposes image generation tools over stdio.

use std::sync::Arc;

use anyhow::Result;

use flux_gen::config::Config;
use flux_gen::generator::{FluxGenerator, GeneratorOptions};
use flux_gen::log_info;
use flux_gen::mcp::McpServer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    log_info!(
        "Starting FLUX MCP server (model={}, output={}, timeout={}s)",
        config.model_id,
        config.output_dir.display(),
        config.unload_timeout_secs
    );

    let backend = flux_gen::default_backend(&config);
    let options = GeneratorOptions::from_config(&config, true);
    let generator = Arc::new(FluxGenerator::new(backend, options));

    McpServer::new(generator).run().await
}
