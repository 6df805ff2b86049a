//! MCP Engine server binary.

use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcp_engine::config::{Args, Config, LogFormat, Transport};
use mcp_engine::error::Result;
use mcp_engine::mcp::handler::McpHandler;
use mcp_engine::mcp::server::{McpServer, ServerOptions};
use mcp_engine::mcp::transport::StdioTransport;
use mcp_engine::metrics::Metrics;
use mcp_engine::tools::{self, Sandbox};
use mcp_engine::{http, resources, VERSION};

fn init_logging(config: &Config) {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr; stdout carries the stdio transport.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config: Config = args.into();
    init_logging(&config);

    info!("MCP Engine v{}", VERSION);
    info!("Transport: {:?}", config.transport);

    let sandbox = match &config.sandbox_root {
        Some(root) => Some(Arc::new(Sandbox::new(root)?)),
        None => None,
    };

    let metrics = Metrics::new();
    let mut handler = McpHandler::with_default_namespace(config.server_name.clone());
    tools::register_all_tools(&mut handler, sandbox.clone())?;
    resources::register_builtin_resources(&mut handler, &config, metrics.clone(), sandbox)?;
    info!(
        "Registered {} tools and {} resources",
        handler.tool_count(),
        handler.resource_count()
    );

    let server = Arc::new(McpServer::with_metrics(
        handler,
        ServerOptions::from(&config),
        metrics,
    ));

    let outcome = match config.transport {
        Transport::Stdio => {
            info!("Starting stdio transport...");
            server.run_stdio(StdioTransport::stdio()).await
        }
        Transport::Http => http::start_server(&config, server.clone()).await,
    };

    server.shutdown().await;
    info!("Server stopped");
    outcome
}
