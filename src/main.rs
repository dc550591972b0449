//! Doxie MCP Server
//!
//! Serves the Doxie tools over stdio or streaming HTTP/SSE.

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use doxie_mcp::config::{Args, Config, LogFormat};
use doxie_mcp::mcp::handler::ToolRegistry;
use doxie_mcp::mcp::methods::register_mcp_methods;
use doxie_mcp::mcp::protocol::ServerInfo;
use doxie_mcp::mcp::registry::HandlerRegistry;
use doxie_mcp::mcp::server::McpServer;
use doxie_mcp::observe::default_sink;
use doxie_mcp::tools;
use doxie_mcp::{Result, VERSION};

fn init_tracing(config: &Config) {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout belongs to the protocol on stdio, so logs always go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match config.log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("doxie-mcp: {}", e);
            std::process::exit(2);
        }
    };

    init_tracing(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config));
    // A blocked stdin read would otherwise hold the runtime open.
    runtime.shutdown_background();

    if let Err(e) = &result {
        error!("Server error: {}", e);
    }
    result
}

async fn run(config: Config) -> Result<()> {
    info!("Doxie MCP Server v{}", VERSION);
    info!("Transport: {:?}", config.transport);
    info!("Dispatch: {:?}", config.dispatch);

    let metrics = if config.metrics {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to install metrics recorder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let mut tool_registry = ToolRegistry::new();
    tools::register_all_tools(&mut tool_registry);
    info!("Registered {} MCP tools", tool_registry.tool_count());

    let mut registry = HandlerRegistry::new();
    let server_info = ServerInfo {
        name: "doxie".to_string(),
        version: VERSION.to_string(),
    };
    register_mcp_methods(&mut registry, Arc::new(tool_registry), server_info)?;

    let mut server = McpServer::new(config.clone(), registry, default_sink(metrics.is_some()));
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }

    server.serve().await
}
