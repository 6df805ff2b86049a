//! Model Context Protocol (MCP) implementation.
//!
//! # Architecture
//!
//! - `protocol` - JSON-RPC and MCP wire types
//! - `dispatcher` - method routing and protocol-level errors
//! - `session` - per-connection state machine and the session manager
//! - `handler` - tool/resource traits and the capability registry
//! - `methods` - the protocol methods (`initialize`, `tools/call`, ...)
//! - `transport` - stdio and HTTP bindings
//! - `sse` - Server-Sent Events binding
//! - `server` - the engine tying it all together

pub mod dispatcher;
pub mod handler;
pub mod methods;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sse;
pub mod transport;

pub use dispatcher::{CallContext, Dispatcher};
pub use handler::{McpHandler, ResourceHandler, ToolHandler};
pub use protocol::*;
pub use server::{McpServer, ServerOptions};
pub use session::{Session, SessionManager, SessionState};
pub use sse::{SseClient, SseManager};
pub use transport::{HttpTransport, Message, StdioTransport, Transport};
