//! Handlers for the fixed MCP method set.
//!
//! `initialize`, `initialized`, `resources/list`, `resources/read`,
//! `tools/list`, `tools/call` and `ping`, registered onto a [`Dispatcher`].
//! State transitions are left to the session owner in the server.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::ResultCache;
use crate::error::{Error, Result};
use crate::mcp::dispatcher::{CallContext, Dispatcher};
use crate::mcp::handler::{shape_tool_result, McpHandler};
use crate::mcp::protocol::{
    CallToolParams, InitializeParams, InitializeResult, ListResourcesResult, ListToolsResult,
    ReadResourceResult, ResourceContents, ServerCapabilities, ServerInfo, MCP_VERSION,
};
use crate::metrics::{Metrics, Timer};

/// Method names.
pub mod names {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PING: &str = "ping";
}

/// Shared state the method handlers run against.
pub struct MethodContext {
    pub registry: Arc<McpHandler>,
    pub cache: Arc<ResultCache>,
    pub metrics: Arc<Metrics>,
    pub server_info: ServerInfo,
    pub tool_timeout: Duration,
    pub cache_ttl: Duration,
    pub instructions: Option<String>,
}

/// Bind every protocol method to `dispatcher`.
pub fn register_protocol_methods(dispatcher: &mut Dispatcher, ctx: Arc<MethodContext>) {
    let c = ctx.clone();
    dispatcher.register_method(names::INITIALIZE, move |params, call| {
        let c = c.clone();
        async move { c.initialize(params, call).await }
    });

    dispatcher.register_method(names::INITIALIZED, |_, call| initialized(call));
    dispatcher.register_method(names::INITIALIZED_NOTIFICATION, |_, call| initialized(call));

    let c = ctx.clone();
    dispatcher.register_method(names::RESOURCES_LIST, move |_, _| {
        let c = c.clone();
        async move { c.list_resources() }
    });

    let c = ctx.clone();
    dispatcher.register_method(names::RESOURCES_READ, move |params, _| {
        let c = c.clone();
        async move { c.read_resource(params).await }
    });

    let c = ctx.clone();
    dispatcher.register_method(names::TOOLS_LIST, move |_, _| {
        let c = c.clone();
        async move { c.list_tools() }
    });

    let c = ctx;
    dispatcher.register_method(names::TOOLS_CALL, move |params, call| {
        let c = c.clone();
        async move { c.call_tool(params, call).await }
    });

    dispatcher.register_method(names::PING, |_, _| async { Ok(json!({ "message": "pong" })) });
}

async fn initialized(call: CallContext) -> Result<Value> {
    if let Some(session) = &call.session {
        debug!(session = %session.id(), "Client confirmed initialization");
    }
    Ok(Value::Null)
}

impl MethodContext {
    async fn initialize(&self, params: Option<Value>, call: CallContext) -> Result<Value> {
        let params: InitializeParams = match params {
            Some(p) => serde_json::from_value(p)
                .map_err(|e| Error::InvalidParams(format!("invalid initialize params: {}", e)))?,
            None => InitializeParams::default(),
        };

        info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol = %params.protocol_version,
            "MCP client initializing"
        );

        if let Some(session) = &call.session {
            session.set_client_info(params.client_info).await;
        }

        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities::engine_default(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn list_resources(&self) -> Result<Value> {
        Ok(serde_json::to_value(ListResourcesResult {
            resources: self.registry.list_resources(),
        })?)
    }

    fn list_tools(&self) -> Result<Value> {
        Ok(serde_json::to_value(ListToolsResult {
            tools: self.registry.list_tools(),
        })?)
    }

    async fn read_resource(&self, params: Option<Value>) -> Result<Value> {
        let timer = Timer::start();

        let uri = match &params {
            Some(Value::Object(map)) => {
                if map.contains_key("arguments") {
                    return Err(Error::InvalidParams(
                        "resources/read expects 'uri' parameter, not 'arguments'. Use tools/call for tool execution"
                            .to_string(),
                    ));
                }
                map.get("uri").and_then(Value::as_str).unwrap_or_default().to_string()
            }
            Some(Value::Null) | None => String::new(),
            Some(_) => {
                return Err(Error::InvalidParams(
                    "resources/read params must be an object".to_string(),
                ))
            }
        };

        if uri.is_empty() {
            return Err(Error::InvalidParams(
                "uri parameter is required for resources/read method".to_string(),
            ));
        }

        let resource = self
            .registry
            .get_resource(&uri)
            .ok_or_else(|| Error::ResourceNotFound(uri.clone()))?;
        let definition = resource.definition();

        if let Some(cached) = self.cache.get(&uri) {
            self.metrics
                .record_resource_read(&uri, timer.elapsed(), None, true);
            debug!(uri = %uri, "Resource served from cache");
            return contents(definition.uri, definition.mime_type, cached);
        }

        let read = resource.read(&uri).await;
        let error = read.as_ref().err().map(ToString::to_string);
        self.metrics
            .record_resource_read(&uri, timer.elapsed(), error.as_deref(), false);

        let text = match read.map_err(|e| Error::ResourceReadFailed(e.to_string()))? {
            Value::String(s) => s,
            other => serde_json::to_string(&other)?,
        };

        // The cache is the only lock taken here.
        self.cache
            .insert(uri, Value::String(text.clone()), self.cache_ttl);

        contents(definition.uri, definition.mime_type, Value::String(text))
    }

    async fn call_tool(&self, params: Option<Value>, call: CallContext) -> Result<Value> {
        let params: CallToolParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::InvalidParams(format!("invalid tools/call params: {}", e)))?
            .ok_or_else(|| Error::InvalidParams("tools/call requires params".to_string()))?;

        if !self.registry.has_tool(&params.name) {
            return Err(Error::ToolNotFound(params.name));
        }

        let timer = Timer::start();
        let scope = call.cancellation_token();
        let outcome = self
            .registry
            .invoke_tool(&params.name, params.arguments, &scope, self.tool_timeout)
            .await;

        let error = outcome.as_ref().err().map(ToString::to_string);
        self.metrics
            .record_tool_execution(&params.name, timer.elapsed(), error.as_deref());

        let value = outcome?;
        Ok(serde_json::to_value(shape_tool_result(value)?)?)
    }
}

fn contents(uri: String, mime_type: String, text: Value) -> Result<Value> {
    let text = match text {
        Value::String(s) => s,
        other => serde_json::to_string(&other)?,
    };
    Ok(serde_json::to_value(ReadResourceResult {
        contents: vec![ResourceContents {
            uri,
            mime_type,
            text,
        }],
    })?)
}
