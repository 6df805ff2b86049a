//! Configuration management for the MCP engine.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the MCP engine.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Model Context Protocol engine serving tools and resources over stdio, HTTP and SSE")]
pub struct Args {
    /// Transport mode: stdio or http
    #[arg(short, long, default_value = "stdio", env = "MCP_ENGINE_TRANSPORT")]
    pub transport: Transport,

    /// HTTP bind host (only for http transport)
    #[arg(long, default_value = "0.0.0.0", env = "MCP_ENGINE_HOST")]
    pub host: String,

    /// HTTP port (only for http transport)
    #[arg(short, long, default_value = "3000", env = "MCP_ENGINE_PORT")]
    pub port: u16,

    /// Path of the MCP endpoint
    #[arg(long, default_value = "/mcp", env = "MCP_ENGINE_ENDPOINT")]
    pub endpoint: String,

    /// Server name reported by initialize and discovery
    #[arg(long, default_value = "mcp-engine", env = "MCP_ENGINE_SERVER_NAME")]
    pub server_name: String,

    /// Sandbox root for the filesystem tools; they are disabled when unset
    #[arg(short, long, env = "MCP_ENGINE_SANDBOX_ROOT")]
    pub sandbox_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "MCP_ENGINE_DEBUG")]
    pub debug: bool,

    /// Log output format
    #[arg(long, default_value = "text", env = "MCP_ENGINE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Idle session timeout in seconds
    #[arg(long, default_value = "1800", env = "MCP_ENGINE_SESSION_TIMEOUT")]
    pub session_timeout_secs: u64,

    /// Idle session sweep interval in seconds
    #[arg(long, default_value = "300", env = "MCP_ENGINE_SWEEP_INTERVAL")]
    pub sweep_interval_secs: u64,

    /// Maximum tool execution time in seconds
    #[arg(long, default_value = "30", env = "MCP_ENGINE_TOOL_TIMEOUT")]
    pub tool_timeout_secs: u64,

    /// Resource read cache TTL in seconds
    #[arg(long, default_value = "300", env = "MCP_ENGINE_CACHE_TTL")]
    pub cache_ttl_secs: u64,

    /// Maximum number of cached resource reads
    #[arg(long, default_value = "100", env = "MCP_ENGINE_CACHE_CAPACITY")]
    pub cache_capacity: usize,

    /// SSE keep-alive interval in seconds
    #[arg(long, default_value = "30", env = "MCP_ENGINE_SSE_KEEPALIVE")]
    pub sse_keepalive_secs: u64,
}

/// Transport mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
    Http,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Transport mode
    pub transport: Transport,
    /// HTTP bind host
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// MCP endpoint path, always starting with `/`
    pub endpoint: String,
    pub server_name: String,
    /// Sandbox root for filesystem tools
    pub sandbox_root: Option<PathBuf>,
    /// Debug mode
    pub debug: bool,
    pub log_format: LogFormat,
    pub session_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub tool_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub sse_keepalive_secs: u64,
}

impl Config {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn sse_keepalive(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_secs.max(1))
    }

    /// Bind address for the HTTP transport.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Normalize an endpoint path to a leading slash and no trailing slash.
fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/mcp".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            transport: args.transport,
            host: args.host,
            port: args.port,
            endpoint: normalize_endpoint(&args.endpoint),
            server_name: args.server_name,
            sandbox_root: args.sandbox_root,
            debug: args.debug,
            log_format: args.log_format,
            session_timeout_secs: args.session_timeout_secs,
            sweep_interval_secs: args.sweep_interval_secs,
            tool_timeout_secs: args.tool_timeout_secs,
            cache_ttl_secs: args.cache_ttl_secs,
            cache_capacity: args.cache_capacity,
            sse_keepalive_secs: args.sse_keepalive_secs,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::Stdio,
            host: "0.0.0.0".to_string(),
            port: 3000,
            endpoint: "/mcp".to_string(),
            server_name: "mcp-engine".to_string(),
            sandbox_root: None,
            debug: false,
            log_format: LogFormat::Text,
            session_timeout_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            tool_timeout_secs: 30,
            cache_ttl_secs: 5 * 60,
            cache_capacity: 100,
            sse_keepalive_secs: 30,
        }
    }
}
