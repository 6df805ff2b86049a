//! MCP Engine
//!
//! A Model Context Protocol server engine: JSON-RPC 2.0 dispatch, a
//! per-connection session state machine, and tools and resources exposed
//! over stdio, HTTP and Server-Sent Events.
//!
//! # Architecture
//!
//! 1. **Protocol Layer** (`mcp`) - wire types, dispatcher, sessions, transports
//! 2. **Capability Layer** (`tools`, `resources`) - built-in tools and resources
//! 3. **Support** (`cache`, `metrics`, `config`) - result cache, recorder, settings
//! 4. **HTTP Server** (`http`) - axum router for HTTP, SSE and discovery

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod mcp;
pub mod metrics;
pub mod resources;
pub mod tools;

pub use error::{Error, Result};

/// Server version reported in `initialize` and discovery documents.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
