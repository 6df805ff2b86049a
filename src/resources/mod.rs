//! Built-in MCP resources.
//!
//! - `config://server/options` - sanitized server configuration
//! - `metrics://server/stats` - live metrics snapshot
//! - `system://runtime/info` - host and process facts
//! - `files://sandbox/tree` - files under the sandbox root, when configured

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mcp::handler::{McpHandler, ResourceHandler};
use crate::mcp::protocol::Resource;
use crate::metrics::Metrics;
use crate::tools::Sandbox;

const JSON_MIME: &str = "application/json";

/// Sanitized view of the server configuration.
pub struct ConfigResource {
    config: Value,
}

impl ConfigResource {
    pub fn new(config: &Config) -> Result<Self> {
        let mut value = serde_json::to_value(config)?;
        if let Some(obj) = value.as_object_mut() {
            // Never expose host paths.
            obj.remove("sandbox_root");
            obj.insert(
                "sandbox_enabled".to_string(),
                Value::Bool(config.sandbox_root.is_some()),
            );
        }
        Ok(Self { config: value })
    }
}

#[async_trait]
impl ResourceHandler for ConfigResource {
    fn definition(&self) -> Resource {
        Resource {
            uri: "config://server/options".to_string(),
            name: "Server Configuration".to_string(),
            description: "Current server configuration".to_string(),
            mime_type: JSON_MIME.to_string(),
        }
    }

    async fn read(&self, _uri: &str) -> Result<Value> {
        Ok(self.config.clone())
    }
}

/// Snapshot of the server's metrics.
pub struct MetricsResource {
    metrics: Arc<Metrics>,
}

impl MetricsResource {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl ResourceHandler for MetricsResource {
    fn definition(&self) -> Resource {
        Resource {
            uri: "metrics://server/stats".to_string(),
            name: "Server Metrics".to_string(),
            description: "Request, tool and resource statistics".to_string(),
            mime_type: JSON_MIME.to_string(),
        }
    }

    async fn read(&self, _uri: &str) -> Result<Value> {
        Ok(serde_json::to_value(self.metrics.snapshot())?)
    }
}

/// Runtime facts about the host and process.
pub struct SystemResource {
    started: Instant,
    started_at: DateTime<Utc>,
}

impl SystemResource {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

impl Default for SystemResource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceHandler for SystemResource {
    fn definition(&self) -> Resource {
        Resource {
            uri: "system://runtime/info".to_string(),
            name: "System Information".to_string(),
            description: "Operating system, architecture and process details".to_string(),
            mime_type: JSON_MIME.to_string(),
        }
    }

    async fn read(&self, _uri: &str) -> Result<Value> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "cpus": cpus,
            "pid": std::process::id(),
            "version": crate::VERSION,
            "startedAt": self.started_at.to_rfc3339(),
            "uptimeSeconds": self.started.elapsed().as_secs(),
        }))
    }
}

/// Every regular file under the sandbox root.
pub struct SandboxTreeResource {
    sandbox: Arc<Sandbox>,
}

impl SandboxTreeResource {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }

    /// Relative paths of all files, sorted. Symlinks are not followed.
    async fn files(&self) -> Result<Vec<String>> {
        let sandbox = self.sandbox.clone();
        tokio::task::spawn_blocking(move || {
            let mut files: Vec<String> = WalkDir::new(sandbox.root())
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| sandbox.relative(e.path()))
                .collect();
            files.sort();
            files
        })
        .await
        .map_err(|e| Error::ResourceReadFailed(format!("sandbox walk failed: {}", e)))
    }
}

#[async_trait]
impl ResourceHandler for SandboxTreeResource {
    fn definition(&self) -> Resource {
        Resource {
            uri: "files://sandbox/tree".to_string(),
            name: "Sandbox Files".to_string(),
            description: "Files available to the file tools".to_string(),
            mime_type: JSON_MIME.to_string(),
        }
    }

    async fn read(&self, _uri: &str) -> Result<Value> {
        Ok(json!({ "files": self.files().await? }))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let root = self.sandbox.root().to_string_lossy().into_owned();
        Ok(self
            .files()
            .await?
            .into_iter()
            .map(|rel| format!("file://{}/{}", root.trim_end_matches('/'), rel))
            .collect())
    }
}

/// Register the built-in resources.
pub fn register_builtin_resources(
    handler: &mut McpHandler,
    config: &Config,
    metrics: Arc<Metrics>,
    sandbox: Option<Arc<Sandbox>>,
) -> Result<()> {
    handler.register_resource(ConfigResource::new(config)?);
    handler.register_resource(MetricsResource::new(metrics));
    handler.register_resource(SystemResource::new());
    if let Some(sandbox) = sandbox {
        handler.register_resource(SandboxTreeResource::new(sandbox));
    }
    Ok(())
}
