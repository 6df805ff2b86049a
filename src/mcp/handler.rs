//! Tool and resource capabilities, their registry, and bounded tool invocation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::{Resource, Tool, ToolResult};

/// Handler for MCP tool calls.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> Tool;

    /// Execute the tool with the given arguments.
    ///
    /// `cancel` is the caller's scope. The registry aborts the call on its
    /// own when the scope fires; long-running tools may also poll it.
    async fn execute(&self, arguments: HashMap<String, Value>, cancel: CancellationToken)
        -> Result<Value>;
}

/// Handler for MCP resource reads.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Get the resource definition.
    fn definition(&self) -> Resource;

    /// Read the resource content addressed by `uri`.
    ///
    /// A string is served as-is; any other value is JSON-encoded.
    async fn read(&self, uri: &str) -> Result<Value>;

    /// Enumerate sub-resource URIs.
    async fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Registry of tools and resources, keyed by name and URI.
#[derive(Clone, Default)]
pub struct McpHandler {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    resources: HashMap<String, Arc<dyn ResourceHandler>>,
    default_namespace: String,
}

impl McpHandler {
    /// Create a new handler registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose empty namespace falls back to `namespace`.
    pub fn with_default_namespace(namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Register a tool handler.
    pub fn register<T: ToolHandler + 'static>(&mut self, handler: T) {
        self.register_arc(Arc::new(handler));
    }

    /// Register a tool handler (Arc version).
    pub fn register_arc(&mut self, handler: Arc<dyn ToolHandler>) {
        let tool = handler.definition();
        self.tools.insert(tool.name, handler);
    }

    /// Register a resource handler under its URI.
    pub fn register_resource<R: ResourceHandler + 'static>(&mut self, handler: R) {
        self.register_resource_arc(Arc::new(handler));
    }

    pub fn register_resource_arc(&mut self, handler: Arc<dyn ResourceHandler>) {
        let resource = handler.definition();
        self.resources.insert(resource.uri, handler);
    }

    /// Register a tool as `mcp__{namespace}__{name}`.
    pub fn register_tool_in_namespace(&mut self, handler: Arc<dyn ToolHandler>, namespace: &str) {
        let key = self.namespaced(namespace, &handler.definition().name);
        self.tools.insert(key, handler);
    }

    /// Register a resource as `mcp__{namespace}__{uri}`.
    pub fn register_resource_in_namespace(
        &mut self,
        handler: Arc<dyn ResourceHandler>,
        namespace: &str,
    ) {
        let key = self.namespaced(namespace, &handler.definition().uri);
        self.resources.insert(key, handler);
    }

    /// Register a batch of tools and resources under one namespace.
    pub fn register_namespace(
        &mut self,
        namespace: &str,
        tools: Vec<Arc<dyn ToolHandler>>,
        resources: Vec<Arc<dyn ResourceHandler>>,
    ) -> Result<()> {
        if namespace.is_empty() {
            return Err(Error::InvalidNamespace(
                "namespace name cannot be empty".to_string(),
            ));
        }
        for tool in tools {
            self.register_tool_in_namespace(tool, namespace);
        }
        for resource in resources {
            self.register_resource_in_namespace(resource, namespace);
        }
        Ok(())
    }

    fn namespaced(&self, namespace: &str, name: &str) -> String {
        let ns = if namespace.is_empty() {
            self.default_namespace.as_str()
        } else {
            namespace
        };
        format!("mcp__{}__{}", ns, name)
    }

    /// Get all registered tools, reported under their registry keys.
    pub fn list_tools(&self) -> Vec<Tool> {
        self.tools
            .iter()
            .map(|(key, h)| Tool {
                name: key.clone(),
                ..h.definition()
            })
            .collect()
    }

    /// Get all registered resources, reported under their registry keys.
    pub fn list_resources(&self) -> Vec<Resource> {
        self.resources
            .iter()
            .map(|(key, h)| Resource {
                uri: key.clone(),
                ..h.definition()
            })
            .collect()
    }

    /// Get a tool by name.
    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn get_resource(&self, uri: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.resources.get(uri).cloned()
    }

    /// Check if a tool exists.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn has_resource(&self, uri: &str) -> bool {
        self.resources.contains_key(uri)
    }

    /// Get the number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Invoke a tool under `deadline`, tied to `scope`.
    ///
    /// The tool runs on its own task so a panic is caught at the join
    /// boundary. Deadline expiry and scope cancellation both abort the task.
    pub async fn invoke_tool(
        &self,
        name: &str,
        arguments: HashMap<String, Value>,
        scope: &CancellationToken,
        deadline: Duration,
    ) -> Result<Value> {
        let tool = self
            .get_tool(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        if scope.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let child = scope.child_token();
        let mut task = tokio::spawn({
            let child = child.clone();
            async move { tool.execute(arguments, child).await }
        });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    warn!(tool = %name, panic = %message, "Tool panicked");
                    Err(Error::ToolPanicked(message))
                }
                Err(e) => Err(Error::Internal(format!("tool task failed: {}", e))),
            },
            _ = tokio::time::sleep(deadline) => {
                child.cancel();
                task.abort();
                debug!(tool = %name, ?deadline, "Tool deadline exceeded");
                Err(Error::Timeout(deadline))
            }
            _ = scope.cancelled() => {
                task.abort();
                debug!(tool = %name, "Tool call cancelled with its session");
                Err(Error::Cancelled)
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Shape a tool's return value into a `tools/call` result.
///
/// Strings become one text block, objects already carrying a `content`
/// array pass through, anything else is JSON-encoded into one text block.
pub fn shape_tool_result(value: Value) -> Result<ToolResult> {
    match value {
        Value::String(text) => Ok(success_result(text)),
        Value::Object(map) if map.get("content").is_some_and(Value::is_array) => {
            let is_error = map.get("isError").and_then(Value::as_bool).unwrap_or(false);
            let content = match map.get("content") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            Ok(ToolResult { content, is_error })
        }
        Value::Object(ref map) => {
            let is_error = map.get("isError").and_then(Value::as_bool).unwrap_or(false);
            let text = serde_json::to_string(&value)?;
            let mut result = success_result(text);
            result.is_error = is_error;
            Ok(result)
        }
        other => Ok(success_result(serde_json::to_string(&other)?)),
    }
}

/// Helper macro for creating tool input schemas.
#[macro_export]
macro_rules! tool_schema {
    ($($json:tt)+) => {
        serde_json::json!({
            "type": "object",
            "properties": {
                $($json)+
            }
        })
    };
}

/// Helper to create a text content block.
pub fn text_content(text: impl Into<String>) -> Value {
    serde_json::json!({ "type": "text", "text": text.into() })
}

/// Helper to create a successful tool result.
pub fn success_result(text: impl Into<String>) -> ToolResult {
    ToolResult {
        content: vec![text_content(text)],
        is_error: false,
    }
}

/// Helper to extract a required string argument.
pub fn get_string_arg(args: &HashMap<String, Value>, name: &str) -> Result<String> {
    args.get(name)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| {
            Error::InvalidToolArguments(format!("Missing required argument: {}", name))
        })
}

/// Helper to extract an optional string argument.
pub fn get_optional_string_arg(args: &HashMap<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(String::from)
}

/// Helper to extract a required numeric argument.
pub fn get_number_arg(args: &HashMap<String, Value>, name: &str) -> Result<f64> {
    args.get(name).and_then(|v| v.as_f64()).ok_or_else(|| {
        Error::InvalidToolArguments(format!("{} must be a number", name))
    })
}

/// Helper to extract an optional string-to-string map argument.
pub fn get_string_map_arg(args: &HashMap<String, Value>, name: &str) -> HashMap<String, String> {
    args.get(name)
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
