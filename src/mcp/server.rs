//! MCP server implementation.
//!
//! `McpServer` owns the dispatcher, registry, cache, metrics, sessions and
//! SSE clients. Every transport funnels requests through
//! [`McpServer::handle_request`], which also drives the session state
//! machine from protocol events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::{ResultCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::mcp::dispatcher::{CallContext, Dispatcher};
use crate::mcp::handler::McpHandler;
use crate::mcp::methods::{names, register_protocol_methods, MethodContext};
use crate::mcp::protocol::*;
use crate::mcp::session::{
    generate_session_id, Session, SessionManager, SessionState, TransportKind,
    DEFAULT_SESSION_TIMEOUT, DEFAULT_SWEEP_INTERVAL,
};
use crate::mcp::sse::{SseClient, SseManager, SseTransport};
use crate::mcp::transport::{HttpTransport, Message, Transport};
use crate::metrics::{Metrics, Timer, UNKNOWN_METHOD};
use crate::VERSION;

/// Default maximum tool execution time.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub server_info: ServerInfo,
    pub instructions: Option<String>,
    pub tool_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_info: ServerInfo {
                name: "mcp-engine".to_string(),
                version: VERSION.to_string(),
            },
            instructions: None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        Self {
            server_info: ServerInfo {
                name: config.server_name.clone(),
                version: VERSION.to_string(),
            },
            instructions: None,
            tool_timeout: config.tool_timeout(),
            cache_ttl: config.cache_ttl(),
            cache_capacity: config.cache_capacity,
            session_timeout: config.session_timeout(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// Result of one HTTP exchange.
#[derive(Debug)]
pub struct HttpExchange {
    /// Id of a session created by this exchange.
    pub created_session: Option<String>,
}

/// MCP server.
pub struct McpServer {
    dispatcher: Dispatcher,
    registry: Arc<McpHandler>,
    cache: Arc<ResultCache>,
    metrics: Arc<Metrics>,
    sessions: SessionManager,
    sse: SseManager,
    server_info: ServerInfo,
}

impl McpServer {
    /// Create a server. Must be called inside a tokio runtime.
    pub fn new(registry: McpHandler, options: ServerOptions) -> Self {
        Self::with_metrics(registry, options, Metrics::new())
    }

    /// Create a server recording into an existing metrics collector.
    pub fn with_metrics(registry: McpHandler, options: ServerOptions, metrics: Arc<Metrics>) -> Self {
        let registry = Arc::new(registry);
        let cache = Arc::new(ResultCache::new(options.cache_capacity));

        let context = Arc::new(MethodContext {
            registry: registry.clone(),
            cache: cache.clone(),
            metrics: metrics.clone(),
            server_info: options.server_info.clone(),
            tool_timeout: options.tool_timeout,
            cache_ttl: options.cache_ttl,
            instructions: options.instructions,
        });

        let mut dispatcher = Dispatcher::new();
        register_protocol_methods(&mut dispatcher, context);

        Self {
            dispatcher,
            registry,
            cache,
            metrics,
            sessions: SessionManager::new(options.session_timeout, options.sweep_interval),
            sse: SseManager::new(),
            server_info: options.server_info,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<McpHandler> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn sse(&self) -> &SseManager {
        &self.sse
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Handle one request. Notifications are executed but yield `None`.
    pub async fn handle_request(
        &self,
        request: &JsonRpcRequest,
        session: Option<Arc<Session>>,
    ) -> Option<JsonRpcResponse> {
        let response = self.handle(request, session).await;
        if request.is_notification() {
            None
        } else {
            Some(response)
        }
    }

    /// Dispatch, record metrics and advance the session on success.
    ///
    /// Handshake methods are checked against the session state first and
    /// rejected with a state error when the transition is not allowed.
    async fn handle(&self, request: &JsonRpcRequest, session: Option<Arc<Session>>) -> JsonRpcResponse {
        debug!("Handling request: {} (id: {:?})", request.method, request.id);
        let timer = Timer::start();

        if let Some(session) = &session {
            session.touch().await;
        }

        let response = match self.check_handshake(request, session.as_deref()).await {
            Err(e) => {
                warn!(method = %request.method, error = %e, "Rejected handshake request");
                JsonRpcResponse::failure(request.id.clone(), JsonRpcError::state_error(e.to_string()))
            }
            Ok(()) => {
                let ctx = match &session {
                    Some(s) => CallContext::for_session(s.clone()),
                    None => CallContext::detached(),
                };
                self.dispatcher.handle(request, ctx).await
            }
        };

        // Unregistered names share one key so clients cannot grow the table.
        let method_key = if self.dispatcher.has_method(&request.method) {
            request.method.as_str()
        } else {
            UNKNOWN_METHOD
        };
        self.metrics.record_request(
            method_key,
            timer.elapsed(),
            response.error.as_ref().map(|e| e.message.as_str()),
        );

        if let (Some(session), false) = (&session, response.is_error()) {
            self.advance_session(session, &request.method).await;
        }
        response
    }

    async fn check_handshake(&self, request: &JsonRpcRequest, session: Option<&Session>) -> Result<()> {
        let (Some(session), Some(next)) = (session, handshake_target(&request.method)) else {
            return Ok(());
        };
        let from = session.state().await;
        if from.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition { from, to: next })
        }
    }

    async fn advance_session(&self, session: &Session, method: &str) {
        let next = match handshake_target(method) {
            Some(next) => next,
            None => {
                if session.state().await != SessionState::Ready {
                    return;
                }
                SessionState::Active
            }
        };

        // Only reachable when a concurrent request moved the session first.
        if let Err(e) = session.transition(next).await {
            warn!(session = %session.id(), method, error = %e, "Session transition rejected");
        }
    }

    /// Serve a line-oriented transport until end of input.
    ///
    /// Requests are processed one at a time under a single session that
    /// lives as long as the loop.
    pub async fn run_stdio<T: Transport>(&self, transport: T) -> Result<()> {
        info!("Starting MCP server: {} v{}", self.server_info.name, self.server_info.version);
        let session = self
            .sessions
            .create_session(generate_session_id(), TransportKind::Stdio)
            .await;

        let outcome = self.serve_lines(&transport, &session).await;

        self.sessions.remove_session(session.id()).await;
        transport.close().await?;
        info!("MCP server stopped");
        outcome
    }

    async fn serve_lines<T: Transport>(&self, transport: &T, session: &Arc<Session>) -> Result<()> {
        loop {
            let reply = match transport.receive().await {
                Ok(request) => self.handle_request(&request, Some(session.clone())).await,
                Err(Error::EndOfStream) => {
                    debug!("End of input, stopping");
                    return Ok(());
                }
                Err(Error::Parse(detail)) => {
                    warn!("Failed to parse message: {}", detail);
                    Some(JsonRpcResponse::failure(None, JsonRpcError::parse_error(detail)))
                }
                Err(e) => {
                    error!("Error reading input: {}", e);
                    return Err(e);
                }
            };

            if let Some(response) = reply {
                if let Err(e) = transport.send(response.into()).await {
                    error!("Failed to send response: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Run one HTTP exchange, binding it to the session named by
    /// `session_id` when given.
    ///
    /// A successful `initialize` without a session id creates an HTTP
    /// session and reports its id.
    pub async fn process_http(
        &self,
        transport: &HttpTransport,
        session_id: Option<&str>,
    ) -> Result<HttpExchange> {
        let request = transport.receive().await?;

        let (session, created) = match session_id {
            Some(id) => {
                let session = self
                    .sessions
                    .get_session(id)
                    .await
                    .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
                (Some(session), false)
            }
            None if request.method == names::INITIALIZE => {
                let session = self
                    .sessions
                    .create_session(generate_session_id(), TransportKind::Http)
                    .await;
                (Some(session), true)
            }
            None => (None, false),
        };

        let response = self.handle(&request, session.clone()).await;
        let mut created_session = None;
        if let (true, Some(session)) = (created, &session) {
            if response.is_error() {
                self.sessions.remove_session(session.id()).await;
            } else {
                created_session = Some(session.id().to_string());
            }
        }

        if !request.is_notification() {
            transport.send(response.into()).await?;
        }
        Ok(HttpExchange { created_session })
    }

    /// Accept a side-channel request for an SSE client. The reply is
    /// delivered later on the client's event stream.
    pub async fn submit_sse_request(&self, client_id: &str, transport: &HttpTransport) -> Result<()> {
        if self.sse.get_client(client_id).await.is_none() {
            return Err(Error::ClientNotFound(client_id.to_string()));
        }
        let request = transport.receive().await?;
        debug!(client = %client_id, method = %request.method, "Queued SSE request");
        self.sse.submit_request(client_id, request).await
    }

    /// Register a new SSE client, start its processing loop and return the
    /// client with the receiver its event stream drains.
    pub async fn connect_sse(self: &Arc<Self>) -> (Arc<SseClient>, mpsc::Receiver<Message>) {
        let conn = self.sse.connect().await;
        let session = self
            .sessions
            .create_session(conn.client.id(), TransportKind::Sse)
            .await;

        let server = self.clone();
        tokio::spawn(server.serve_sse_client(Arc::new(conn.transport), session));

        (conn.client, conn.messages)
    }

    /// Drop an SSE client and its session.
    pub async fn disconnect_sse(&self, client_id: &str) {
        self.sse.remove_client(client_id).await;
        self.sessions.remove_session(client_id).await;
    }

    async fn serve_sse_client(self: Arc<Self>, transport: Arc<SseTransport>, session: Arc<Session>) {
        // Each request runs independently, so replies may arrive out of order.
        while let Ok(request) = transport.receive().await {
            let server = self.clone();
            let transport = transport.clone();
            let session = session.clone();
            tokio::spawn(async move {
                server.process_sse_request(&transport, request, session).await;
            });
        }
        debug!(client = %transport.client().id(), "SSE request loop finished");
    }

    async fn process_sse_request(
        &self,
        transport: &SseTransport,
        request: JsonRpcRequest,
        session: Arc<Session>,
    ) {
        let client = transport.client();
        let response = self.handle(&request, Some(session)).await;
        let succeeded = !response.is_error();

        if !request.is_notification() {
            if let Err(e) = transport.send(response.into()).await {
                warn!(client = %client.id(), method = %request.method, error = %e, "SSE delivery failed");
                self.metrics.record_sse_delivery_failure();
            }
        }

        if !succeeded {
            return;
        }
        match request.method.as_str() {
            names::INITIALIZE => client.set_initialized(),
            names::INITIALIZED | names::INITIALIZED_NOTIFICATION => {
                client.set_initialized();
                let ready = JsonRpcNotification::new("ready", Some(serde_json::json!({})));
                match transport.send(ready.into()).await {
                    Ok(()) => client.set_ready(),
                    Err(e) => {
                        warn!(client = %client.id(), error = %e, "Failed to send ready notification");
                        self.metrics.record_sse_delivery_failure();
                    }
                }
            }
            _ => {}
        }
    }

    /// Close every SSE client and session and stop the idle sweep.
    pub async fn shutdown(&self) {
        self.sse.close_all().await;
        self.sessions.close().await;
        info!("MCP server shut down");
    }
}

/// State a handshake method moves its session to.
fn handshake_target(method: &str) -> Option<SessionState> {
    match method {
        names::INITIALIZE => Some(SessionState::Initialized),
        names::INITIALIZED | names::INITIALIZED_NOTIFICATION => Some(SessionState::Ready),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handler::ToolHandler;
    use crate::mcp::transport::StdioTransport;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use axum::http::Method;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::io::BufReader;
    use tokio_util::sync::CancellationToken;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        fn definition(&self) -> Tool {
            Tool {
                name: "echo".to_string(),
                description: "Echoes its text argument".to_string(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn execute(&self, args: HashMap<String, Value>, _: CancellationToken) -> Result<Value> {
            Ok(args.get("text").cloned().unwrap_or(Value::Null))
        }
    }

    fn server() -> Arc<McpServer> {
        let mut registry = McpHandler::new();
        registry.register(Echo);
        Arc::new(McpServer::new(registry, ServerOptions::default()))
    }

    fn req(method: &str, id: Option<i64>) -> JsonRpcRequest {
        JsonRpcRequest::new(method, Some(json!({})), id.map(RequestId::number))
    }

    fn http(body: &'static str) -> HttpTransport {
        HttpTransport::new(
            Method::POST,
            Some("application/json".to_string()),
            Bytes::from_static(body.as_bytes()),
        )
    }

    #[tokio::test]
    async fn test_session_lifecycle_driven_by_protocol() {
        let server = server();
        let session = server
            .sessions()
            .create_session("s1", TransportKind::Http)
            .await;

        server.handle_request(&req("initialize", Some(1)), Some(session.clone())).await;
        assert_eq!(session.state().await, SessionState::Initialized);

        let none = server.handle_request(&req("initialized", None), Some(session.clone())).await;
        assert!(none.is_none());
        assert_eq!(session.state().await, SessionState::Ready);

        server.handle_request(&req("ping", Some(2)), Some(session.clone())).await;
        assert_eq!(session.state().await, SessionState::Active);

        server.handle_request(&req("tools/list", Some(3)), Some(session.clone())).await;
        assert_eq!(session.state().await, SessionState::Active);

        server.shutdown().await;
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_failed_request_does_not_advance_session() {
        let server = server();
        let session = server
            .sessions()
            .create_session("s1", TransportKind::Http)
            .await;

        let resp = server
            .handle_request(&req("initialized", Some(1)), Some(session.clone()))
            .await
            .unwrap();
        let error = resp.error.unwrap();
        assert_eq!(error.code, error_codes::STATE_ERROR);
        let detail = error.data.unwrap().to_string();
        assert!(detail.contains("from new to ready"), "{}", detail);
        assert_eq!(session.state().await, SessionState::New);

        server.handle_request(&req("missing", Some(2)), Some(session.clone())).await;
        assert_eq!(session.state().await, SessionState::New);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_initialize_is_rejected() {
        let server = server();
        let session = server
            .sessions()
            .create_session("s1", TransportKind::Http)
            .await;

        let first = server
            .handle_request(&req("initialize", Some(1)), Some(session.clone()))
            .await
            .unwrap();
        assert!(!first.is_error());

        let second = server
            .handle_request(&req("initialize", Some(2)), Some(session.clone()))
            .await
            .unwrap();
        let error = second.error.unwrap();
        assert_eq!(error.code, error_codes::STATE_ERROR);
        assert!(error
            .data
            .unwrap()
            .to_string()
            .contains("from initialized to initialized"));
        assert_eq!(second.id, Some(RequestId::number(2)));
        assert_eq!(session.state().await, SessionState::Initialized);

        // Without a session there is no state to check.
        let detached = server.handle_request(&req("initialized", Some(3)), None).await.unwrap();
        assert!(!detached.is_error());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_session_survives_idle_sweep() {
        let options = ServerOptions {
            session_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(20),
            ..ServerOptions::default()
        };
        let mut registry = McpHandler::new();
        registry.register(Echo);
        let server = McpServer::new(registry, options);
        let session = server
            .sessions()
            .create_session("busy", TransportKind::Stdio)
            .await;

        let call = JsonRpcRequest::new(
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
            Some(RequestId::number(1)),
        );
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let resp = server
                .handle_request(&call, Some(session.clone()))
                .await
                .unwrap();
            assert!(!resp.is_error(), "{:?}", resp.error);
        }

        assert_ne!(session.state().await, SessionState::Closed);
        assert!(server.sessions().list_sessions().await.contains(&"busy".to_string()));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_are_metered() {
        let server = server();
        server.handle_request(&req("ping", Some(1)), None).await;
        server.handle_request(&req("nope", Some(2)), None).await;
        server.handle_request(&req("x\"} 1\nfake_metric{a=\"", Some(3)), None).await;

        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.total_errors, 2);
        assert_eq!(snapshot.methods["ping"].count, 1);
        assert_eq!(snapshot.methods[UNKNOWN_METHOD].count, 2);
        assert_eq!(snapshot.methods.len(), 2);
        assert!(!server.metrics().to_prometheus().contains("fake_metric"));
    }

    #[tokio::test]
    async fn test_run_stdio() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"initialize","params":{},"id":1}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"initialized"}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"jsonrpc":"2.0","method":"ping","id":2}"#,
            "\n",
        );
        let server = server();
        let (client, server_end) = tokio::io::duplex(64 * 1024);
        let transport = StdioTransport::with_io(BufReader::new(input.as_bytes()), server_end);

        server.run_stdio(transport).await.unwrap();
        assert_eq!(server.sessions().session_count().await, 0);

        let mut out = String::new();
        let mut client = BufReader::new(client);
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut out)
            .await
            .unwrap();
        let lines: Vec<JsonRpcResponse> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].id, Some(RequestId::number(1)));
        assert_eq!(lines[1].id, None);
        assert_eq!(lines[1].error.as_ref().unwrap().code, error_codes::PARSE_ERROR);
        assert_eq!(lines[2].result, Some(json!({"message": "pong"})));
    }

    #[tokio::test]
    async fn test_process_http_creates_session_on_initialize() {
        let server = server();
        let transport = http(r#"{"jsonrpc":"2.0","method":"initialize","params":{},"id":1}"#);

        let exchange = server.process_http(&transport, None).await.unwrap();
        let id = exchange.created_session.unwrap();
        let session = server.sessions().get_session(&id).await.unwrap();
        assert_eq!(session.state().await, SessionState::Initialized);
        assert!(matches!(transport.take_outbound().await, Some(Message::Response(_))));

        let follow_up = http(r#"{"jsonrpc":"2.0","method":"initialized"}"#);
        let exchange = server.process_http(&follow_up, Some(&id)).await.unwrap();
        assert!(exchange.created_session.is_none());
        assert!(follow_up.take_outbound().await.is_none());
        assert_eq!(session.state().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn test_process_http_unknown_session() {
        let server = server();
        let transport = http(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#);
        let err = server
            .process_http(&transport, Some("mcp-session-missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_sse_side_channel_round_trip() {
        let server = server();
        let (client, mut messages) = server.connect_sse().await;

        let init = http(r#"{"jsonrpc":"2.0","method":"initialize","params":{},"id":1}"#);
        server.submit_sse_request(client.id(), &init).await.unwrap();
        let reply = messages.recv().await.unwrap();
        assert!(matches!(reply, Message::Response(ref r) if r.id == Some(RequestId::number(1))));

        let confirm = http(r#"{"jsonrpc":"2.0","method":"initialized"}"#);
        server.submit_sse_request(client.id(), &confirm).await.unwrap();
        let ready = messages.recv().await.unwrap();
        assert!(matches!(ready, Message::Notification(ref n) if n.method == "ready"));
        assert!(client.is_initialized());

        // `ready` is flipped right after the notification is queued.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.is_ready());

        server.disconnect_sse(client.id()).await;
        assert_eq!(server.sse().client_count().await, 0);
        assert!(server.sessions().get_session(client.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_sse_delivery_failure_is_counted() {
        let server = server();
        let (client, messages) = server.connect_sse().await;
        drop(messages);

        let ping = http(r#"{"jsonrpc":"2.0","method":"ping","id":7}"#);
        server.submit_sse_request(client.id(), &ping).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.metrics().snapshot().sse_delivery_failures, 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_to_unknown_sse_client() {
        let server = server();
        let ping = http(r#"{"jsonrpc":"2.0","method":"ping","id":7}"#);
        let err = server.submit_sse_request("sse-nope", &ping).await.unwrap_err();
        assert!(matches!(err, Error::ClientNotFound(_)));
    }
}
