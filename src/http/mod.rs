//! HTTP server for MCP over HTTP and SSE.
//!
//! Routes, relative to the configured endpoint (default `/mcp`):
//!
//! - `{endpoint}`: JSON-RPC over POST, or the SSE side-channel when the
//!   `X-SSE-Client-ID` header is present
//! - `{endpoint}/sse`: GET opens an event stream, POST is synchronous JSON-RPC
//! - `{endpoint}/discover`, `/.well-known/mcp.json`, `/.well-known/mcp-servers`
//! - `{endpoint}/metrics`: Prometheus text
//! - `/health`

pub mod discovery;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{any, get},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mcp::protocol::{JsonRpcError, JsonRpcResponse};
use crate::mcp::server::McpServer;
use crate::mcp::sse::SseClient;
use crate::mcp::transport::{HttpTransport, Message};
use discovery::{Discovery, DISCOVERY_CACHE_CONTROL};

/// Header binding a plain HTTP request to a session.
pub const SESSION_HEADER: &str = "x-mcp-session-id";

/// Header routing a request to an SSE client's side-channel.
pub const SSE_CLIENT_HEADER: &str = "x-sse-client-id";

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    server: Arc<McpServer>,
    endpoint: Arc<str>,
    keepalive: Duration,
}

/// Build the router for `server`.
pub fn build_router(server: Arc<McpServer>, config: &Config) -> Router {
    let endpoint = config.endpoint.clone();
    let state = HttpState {
        server,
        endpoint: Arc::from(endpoint.as_str()),
        keepalive: config.sse_keepalive(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/.well-known/mcp.json", get(well_known_config))
        .route("/.well-known/mcp-servers", get(well_known_servers))
        .route(&endpoint, any(mcp_endpoint))
        .route(&format!("{}/sse", endpoint), get(sse_connect).post(sse_post))
        .route(&format!("{}/discover", endpoint), get(discover))
        .route(&format!("{}/metrics", endpoint), get(prometheus_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Start the HTTP server and serve until Ctrl-C.
pub async fn start_server(config: &Config, server: Arc<McpServer>) -> Result<()> {
    let app = build_router(server.clone(), config);

    let addr = config.bind_addr();
    info!("Starting HTTP server on {} (endpoint {})", addr, config.endpoint);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(close_streams_after(server, ctrl_c()))
        .await?;

    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

/// Wait for `signal`, then end every open SSE stream. Graceful shutdown
/// waits for in-flight responses, and an event stream never finishes on
/// its own.
async fn close_streams_after(server: Arc<McpServer>, signal: impl std::future::Future<Output = ()>) {
    signal.await;
    let open = server.sse().client_count().await;
    server.sse().close_all().await;
    info!(clients = open, "Closed SSE streams for shutdown");
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION
    }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn transport_from(method: Method, headers: &HeaderMap, body: Bytes) -> HttpTransport {
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str()).map(String::from);
    HttpTransport::new(method, content_type, body)
}

/// Main MCP endpoint.
async fn mcp_endpoint(
    State(state): State<HttpState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let transport = transport_from(method, &headers, body);

    if let Some(client_id) = header_str(&headers, SSE_CLIENT_HEADER) {
        return match state.server.submit_sse_request(client_id, &transport).await {
            Ok(()) => (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "accepted",
                    "message": "Request queued for processing"
                })),
            )
                .into_response(),
            Err(e) => error_response(e),
        };
    }

    exchange(&state, &transport, header_str(&headers, SESSION_HEADER)).await
}

/// Synchronous JSON-RPC on the SSE sub-path.
async fn sse_post(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let transport = transport_from(Method::POST, &headers, body);
    exchange(&state, &transport, header_str(&headers, SESSION_HEADER)).await
}

async fn exchange(state: &HttpState, transport: &HttpTransport, session_id: Option<&str>) -> Response {
    let outcome = match state.server.process_http(transport, session_id).await {
        Ok(outcome) => outcome,
        Err(e) => return error_response(e),
    };

    let mut response = match transport.take_outbound().await {
        Some(message) => Json(message).into_response(),
        // Notifications are acknowledged without a body.
        None => StatusCode::ACCEPTED.into_response(),
    };

    if let Some(id) = outcome.created_session {
        match HeaderValue::from_str(&id) {
            Ok(value) => {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(SESSION_HEADER), value);
            }
            Err(e) => warn!("Session id is not a valid header value: {}", e),
        }
    }
    response
}

/// Map transport, session and queue errors to HTTP responses.
fn error_response(err: Error) -> Response {
    match err {
        Error::MethodNotAllowed(method) => (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Method not allowed: {}. Use POST for JSON-RPC requests.", method),
        )
            .into_response(),
        Error::UnsupportedContentType(_) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        Error::Parse(detail) => (
            StatusCode::BAD_REQUEST,
            Json(JsonRpcResponse::failure(None, JsonRpcError::parse_error(detail))),
        )
            .into_response(),
        Error::SessionNotFound(_) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() }))).into_response()
        }
        Error::ClientNotFound(_) | Error::ClientClosed(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid SSE client ID" })),
        )
            .into_response(),
        Error::QueueFull(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Request queue full, try again later" })),
        )
            .into_response(),
        other => {
            error!("HTTP exchange failed: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": other.to_string() })),
            )
                .into_response()
        }
    }
}

/// Removes the SSE client and its session once the event stream is dropped.
struct DisconnectGuard {
    server: Arc<McpServer>,
    client_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let server = self.server.clone();
        let client_id = std::mem::take(&mut self.client_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    server.disconnect_sse(&client_id).await;
                });
            }
            Err(_) => debug!(client = %client_id, "No runtime to clean up SSE client"),
        }
    }
}

fn to_event(client: &SseClient, message: &Message) -> Option<Event> {
    let name = match message {
        Message::Response(_) => "message",
        Message::Notification(_) => "notification",
    };
    match message.to_json() {
        Ok(json) => Some(
            Event::default()
                .id(client.next_event_id().to_string())
                .event(name)
                .data(json),
        ),
        Err(e) => {
            error!(client = %client.id(), "Failed to serialize SSE message: {}", e);
            None
        }
    }
}

/// Open an SSE stream. The first event carries the generated client id.
async fn sse_connect(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (client, messages) = state.server.connect_sse().await;
    let guard = DisconnectGuard {
        server: state.server.clone(),
        client_id: client.id().to_string(),
    };

    let greeting = Event::default()
        .id(client.next_event_id().to_string())
        .event("connection")
        .data(
            json!({
                "type": "connection",
                "clientId": client.id(),
                "message": "Connected to MCP SSE endpoint"
            })
            .to_string(),
        );

    let closed = client.closed_token().cancelled_owned();
    let updates = ReceiverStream::new(messages)
        .take_until(closed)
        .filter_map(move |message| {
            let _alive = &guard;
            futures::future::ready(to_event(&client, &message))
        });

    let events = stream::once(futures::future::ready(greeting))
        .chain(updates)
        .map(Ok);

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(state.keepalive)
            .text("keep-alive"),
    )
}

async fn discover(State(state): State<HttpState>, headers: HeaderMap) -> impl IntoResponse {
    let info = Discovery::new(state.server.server_info(), &state.endpoint, &headers).info();
    ([(header::CACHE_CONTROL, DISCOVERY_CACHE_CONTROL)], Json(info))
}

async fn well_known_config(State(state): State<HttpState>, headers: HeaderMap) -> impl IntoResponse {
    let config = Discovery::new(state.server.server_info(), &state.endpoint, &headers).config();
    ([(header::CACHE_CONTROL, DISCOVERY_CACHE_CONTROL)], Json(config))
}

async fn well_known_servers(State(state): State<HttpState>, headers: HeaderMap) -> impl IntoResponse {
    let list = Discovery::new(state.server.server_info(), &state.endpoint, &headers).server_list();
    ([(header::CACHE_CONTROL, DISCOVERY_CACHE_CONTROL)], Json(list))
}

async fn prometheus_metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.server.metrics().to_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handler::McpHandler;
    use crate::mcp::server::ServerOptions;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_shutdown_ends_open_sse_streams() {
        let config = Config::default();
        let server = Arc::new(McpServer::new(McpHandler::new(), ServerOptions::from(&config)));
        let app = build_router(server.clone(), &config);

        let response = app
            .oneshot(Request::get("/mcp/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let mut body = response.into_body();
        let greeting = body.frame().await.unwrap().unwrap();
        assert!(greeting.is_data());
        assert_eq!(server.sse().client_count().await, 1);

        close_streams_after(server.clone(), async {}).await;

        let end = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("stream should end after shutdown");
        assert!(end.is_none());
        assert_eq!(server.sse().client_count().await, 0);
    }
}
