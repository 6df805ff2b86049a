//! Outbound HTTP tool.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mcp::handler::{get_optional_string_arg, get_string_arg, get_string_map_arg, ToolHandler};
use crate::mcp::protocol::Tool;

/// Client timeout for outbound requests.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn user_agent() -> String {
    format!("mcp-engine/{}", crate::VERSION)
}

/// Issue an HTTP request and return status, headers and body.
pub struct HttpRequestTool {
    client: Client,
}

impl HttpRequestTool {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ToolHandler for HttpRequestTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "http_request".to_string(),
            description: "Make HTTP requests to external services".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "The URL to request" },
                    "method": {
                        "type": "string",
                        "enum": ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"],
                        "description": "HTTP method (default: GET)"
                    },
                    "headers": {
                        "type": "object",
                        "additionalProperties": { "type": "string" },
                        "description": "Request headers"
                    },
                    "body": { "type": "string", "description": "Request body" }
                },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, args: HashMap<String, Value>, cancel: CancellationToken) -> Result<Value> {
        let url = get_string_arg(&args, "url")?;
        let method_name = get_optional_string_arg(&args, "method")
            .map(|m| m.to_uppercase())
            .unwrap_or_else(|| "GET".to_string());
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| Error::InvalidToolArguments(format!("invalid method: {}", method_name)))?;

        let mut request = self.client.request(method, &url);
        for (name, value) in get_string_map_arg(&args, "headers") {
            request = request.header(name, value);
        }
        if let Some(body) = get_optional_string_arg(&args, "body") {
            request = request.body(body);
        }

        debug!(%url, method = %method_name, "Outbound HTTP request");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            sent = request.send() => sent?,
        };

        let status = response.status();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), Value::String(v.to_string()));
            }
        }
        let body = response.text().await?;

        Ok(json!({
            "status": status.to_string(),
            "statusCode": status.as_u16(),
            "headers": headers,
            "body": body,
        }))
    }
}
