//! Built-in MCP tools.
//!
//! - `calculator` - two-operand arithmetic
//! - `http_request` - outbound HTTP
//! - `read_file`, `list_directory` - file access confined to a [`Sandbox`]

pub mod calculator;
pub mod filesystem;
pub mod http_request;
pub mod sandbox;

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::mcp::handler::McpHandler;
pub use sandbox::Sandbox;

/// Register all built-in tools with the handler.
///
/// The file tools are only registered when a sandbox is configured.
pub fn register_all_tools(handler: &mut McpHandler, sandbox: Option<Arc<Sandbox>>) -> Result<()> {
    handler.register(calculator::CalculatorTool::new());
    handler.register(http_request::HttpRequestTool::new()?);

    if let Some(sandbox) = sandbox {
        info!(root = %sandbox.root().display(), "Registering sandboxed file tools");
        handler.register(filesystem::ReadFileTool::new(sandbox.clone()));
        handler.register(filesystem::ListDirectoryTool::new(sandbox));
    }

    Ok(())
}
