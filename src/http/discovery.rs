//! Discovery documents advertising the server's transports and endpoints.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::mcp::protocol::{ServerCapabilities, ServerInfo, MCP_VERSION};

/// `Cache-Control` value for discovery responses.
pub const DISCOVERY_CACHE_CONTROL: &str = "public, max-age=300";

/// `/.well-known/mcp.json` document.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryConfig {
    pub version: String,
    pub servers: BTreeMap<String, ServerEntry>,
}

/// One advertised server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerEntry {
    pub transport: String,
    pub endpoint: String,
    pub name: String,
    pub version: String,
    pub metadata: serde_json::Value,
}

/// `/.well-known/mcp-servers` document.
#[derive(Debug, Clone, Serialize)]
pub struct ServerList {
    pub servers: Vec<ServerEntry>,
    pub generated: DateTime<Utc>,
}

/// `{endpoint}/discover` document.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryInfo {
    pub server: ServerInfo,
    pub transport: TransportInfo,
    pub endpoints: EndpointInfo,
    pub capabilities: ServerCapabilities,
    pub generated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportInfo {
    pub http: TransportDetails,
    pub sse: TransportDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportDetails {
    pub supported: bool,
    pub endpoint: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    pub mcp: String,
    pub sse: String,
    pub discovery: String,
    pub well_known: String,
    pub servers: String,
    pub metrics: String,
}

/// Builds discovery documents for one request's view of the server.
pub struct Discovery<'a> {
    server: &'a ServerInfo,
    base_url: String,
    endpoint: &'a str,
}

impl<'a> Discovery<'a> {
    pub fn new(server: &'a ServerInfo, endpoint: &'a str, headers: &HeaderMap) -> Self {
        Self {
            server,
            base_url: base_url(headers),
            endpoint,
        }
    }

    fn mcp_url(&self) -> String {
        format!("{}{}", self.base_url, self.endpoint)
    }

    fn server_key(&self) -> String {
        self.server.name.to_lowercase().replace(' ', "-")
    }

    pub fn server_entry(&self) -> ServerEntry {
        ServerEntry {
            transport: "sse".to_string(),
            endpoint: self.mcp_url(),
            name: self.server.name.clone(),
            version: self.server.version.clone(),
            metadata: json!({
                "supportsHTTP": true,
                "supportsSSE": true,
                "supportsStdio": true,
                "protocolVersion": MCP_VERSION,
            }),
        }
    }

    pub fn config(&self) -> DiscoveryConfig {
        let mut servers = BTreeMap::new();
        servers.insert(self.server_key(), self.server_entry());
        DiscoveryConfig {
            version: "1.0".to_string(),
            servers,
        }
    }

    pub fn server_list(&self) -> ServerList {
        ServerList {
            servers: vec![self.server_entry()],
            generated: Utc::now(),
        }
    }

    pub fn info(&self) -> DiscoveryInfo {
        let mcp = self.mcp_url();
        let sse = format!("{}/sse", mcp);

        DiscoveryInfo {
            server: self.server.clone(),
            transport: TransportInfo {
                http: TransportDetails {
                    supported: true,
                    endpoint: mcp.clone(),
                    method: "POST".to_string(),
                    headers: BTreeMap::from([(
                        "Content-Type".to_string(),
                        "application/json".to_string(),
                    )]),
                },
                sse: TransportDetails {
                    supported: true,
                    endpoint: sse.clone(),
                    method: "GET".to_string(),
                    headers: BTreeMap::from([(
                        "Accept".to_string(),
                        "text/event-stream".to_string(),
                    )]),
                },
            },
            endpoints: EndpointInfo {
                discovery: format!("{}/discover", mcp),
                metrics: format!("{}/metrics", mcp),
                well_known: format!("{}/.well-known/mcp.json", self.base_url),
                servers: format!("{}/.well-known/mcp-servers", self.base_url),
                mcp,
                sse,
            },
            capabilities: ServerCapabilities::engine_default(),
            generated: Utc::now(),
        }
    }
}

/// Scheme and authority the client used, honoring `X-Forwarded-Proto`.
fn base_url(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("http");
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("localhost:3000");
    format!("{}://{}", scheme, host)
}
