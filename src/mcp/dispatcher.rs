//! JSON-RPC 2.0 dispatcher.
//!
//! Validates the protocol version, routes by method name and wraps handler
//! outcomes into responses. Methods are registered once at startup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::mcp::protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION,
};
use crate::mcp::session::Session;

/// Per-call context handed to method handlers.
#[derive(Clone, Default)]
pub struct CallContext {
    pub session: Option<Arc<Session>>,
    scope: Option<CancellationToken>,
}

impl CallContext {
    /// Context bound to a session and its cancellation scope.
    pub fn for_session(session: Arc<Session>) -> Self {
        Self {
            scope: Some(session.cancellation_token()),
            session: Some(session),
        }
    }

    /// Context with no session and a fresh, standalone scope.
    pub fn detached() -> Self {
        Self {
            session: None,
            scope: Some(CancellationToken::new()),
        }
    }

    /// Cancellation scope for work started by this call.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.scope.clone().unwrap_or_default()
    }
}

/// A registered method handler.
pub type MethodHandler =
    Arc<dyn Fn(Option<Value>, CallContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Routes JSON-RPC requests to registered handlers.
#[derive(Default, Clone)]
pub struct Dispatcher {
    methods: HashMap<String, MethodHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `handler`, replacing any previous binding.
    pub fn register_method<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |params, ctx| Box::pin(handler(params, ctx)));
        self.methods.insert(name.into(), handler);
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Run one already-decoded request through version check, lookup and
    /// invocation. Always produces a response, even for notifications.
    pub async fn handle(&self, request: &JsonRpcRequest, ctx: CallContext) -> JsonRpcResponse {
        let id = request.id.clone();

        if request.jsonrpc != JSONRPC_VERSION {
            warn!(method = %request.method, version = %request.jsonrpc, "Rejected request version");
            return JsonRpcResponse::failure(
                id,
                JsonRpcError::invalid_request(format!(
                    "expected jsonrpc version {}",
                    JSONRPC_VERSION
                )),
            );
        }

        let Some(handler) = self.methods.get(&request.method) else {
            debug!(method = %request.method, "Method not found");
            return JsonRpcResponse::failure(id, JsonRpcError::method_not_found(&request.method));
        };

        match handler(request.params.clone(), ctx).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                debug!(method = %request.method, error = %e, "Method returned error");
                let message = e.to_string();
                JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(e.rpc_code(), message.clone(), Some(Value::String(message))),
                )
            }
        }
    }

    /// Dispatch a decoded request. Notifications are executed but yield `None`.
    pub async fn dispatch(&self, request: &JsonRpcRequest, ctx: CallContext) -> Option<JsonRpcResponse> {
        let response = self.handle(request, ctx).await;
        if request.is_notification() {
            None
        } else {
            Some(response)
        }
    }

    /// Byte-in/byte-out dispatch. Undecodable input yields a parse-error
    /// response with a null id.
    pub async fn dispatch_bytes(&self, bytes: &[u8], ctx: CallContext) -> Option<Vec<u8>> {
        let response = match serde_json::from_slice::<JsonRpcRequest>(bytes) {
            Ok(request) => self.dispatch(&request, ctx).await?,
            Err(e) => JsonRpcResponse::failure(None, JsonRpcError::parse_error(e.to_string())),
        };

        match serde_json::to_vec(&response) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                error!(error = %e, "Failed to encode response");
                None
            }
        }
    }
}
