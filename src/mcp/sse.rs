//! Server-Sent Events binding.
//!
//! Each connected client owns a bounded outbound message queue, drained by
//! its event stream, and a bounded request queue fed by the HTTP
//! side-channel. The manager tracks live clients for unicast and broadcast.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mcp::protocol::JsonRpcRequest;
use crate::mcp::transport::{Message, Transport};

/// Outbound messages buffered per client.
pub const CLIENT_MESSAGE_BUFFER: usize = 100;

/// Side-channel requests buffered per client.
pub const CLIENT_REQUEST_BUFFER: usize = 10;

/// Generate a new SSE client id.
pub fn generate_client_id() -> String {
    format!("sse-{}", Uuid::new_v4())
}

/// One connected SSE client.
#[derive(Debug)]
pub struct SseClient {
    id: String,
    outbound: mpsc::Sender<Message>,
    requests: mpsc::Sender<JsonRpcRequest>,
    closed: CancellationToken,
    initialized: AtomicBool,
    ready: AtomicBool,
    last_event_id: AtomicU64,
}

impl SseClient {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a message for delivery on the event stream.
    pub fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ClientClosed(self.id.clone()));
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => Error::ClientClosed(self.id.clone()),
        })
    }

    /// Queue a side-channel request for processing.
    pub fn submit(&self, request: JsonRpcRequest) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ClientClosed(self.id.clone()));
        }
        self.requests.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => Error::ClientClosed(self.id.clone()),
        })
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the client closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn set_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Next `id:` value for an event on this client's stream.
    pub fn next_event_id(&self) -> u64 {
        self.last_event_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A freshly connected client and the two ends its owner drives.
pub struct SseConnection {
    pub client: Arc<SseClient>,
    /// Drained by the client's event stream.
    pub messages: mpsc::Receiver<Message>,
    /// Request side of the client, for the processing loop.
    pub transport: SseTransport,
}

/// Registry of live SSE clients.
#[derive(Default)]
pub struct SseManager {
    clients: RwLock<HashMap<String, Arc<SseClient>>>,
}

impl SseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client with a generated id.
    pub async fn connect(&self) -> SseConnection {
        let (outbound, messages) = mpsc::channel(CLIENT_MESSAGE_BUFFER);
        let (requests, request_rx) = mpsc::channel(CLIENT_REQUEST_BUFFER);

        let client = Arc::new(SseClient {
            id: generate_client_id(),
            outbound,
            requests,
            closed: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            last_event_id: AtomicU64::new(0),
        });

        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        info!(client = %client.id, "SSE client connected");

        SseConnection {
            transport: SseTransport {
                client: client.clone(),
                requests: Mutex::new(request_rx),
            },
            client,
            messages,
        }
    }

    pub async fn get_client(&self, id: &str) -> Option<Arc<SseClient>> {
        self.clients.read().await.get(id).cloned()
    }

    /// Deliver a message to one client.
    pub async fn send_to_client(&self, id: &str, message: Message) -> Result<()> {
        let client = self
            .get_client(id)
            .await
            .ok_or_else(|| Error::ClientNotFound(id.to_string()))?;
        client.send(message)
    }

    /// Deliver a message to every client, returning how many accepted it.
    pub async fn broadcast_to_all(&self, message: Message) -> usize {
        let clients: Vec<Arc<SseClient>> = self.clients.read().await.values().cloned().collect();

        let mut delivered = 0;
        for client in clients {
            match client.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(client = %client.id, error = %e, "Broadcast delivery failed"),
            }
        }
        delivered
    }

    /// Queue a side-channel request for a client.
    pub async fn submit_request(&self, id: &str, request: JsonRpcRequest) -> Result<()> {
        let client = self
            .get_client(id)
            .await
            .ok_or_else(|| Error::ClientNotFound(id.to_string()))?;
        client.submit(request)
    }

    /// Close and unregister a client.
    pub async fn remove_client(&self, id: &str) -> bool {
        let removed = self.clients.write().await.remove(id);
        match removed {
            Some(client) => {
                client.close();
                info!(client = %id, "SSE client disconnected");
                true
            }
            None => false,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Close and unregister every client.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<SseClient>> =
            self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in drained {
            client.close();
        }
    }
}

/// [`Transport`] view of one SSE client: requests come from the
/// side-channel queue, responses go to the event stream.
pub struct SseTransport {
    client: Arc<SseClient>,
    requests: Mutex<mpsc::Receiver<JsonRpcRequest>>,
}

impl SseTransport {
    pub fn client(&self) -> &Arc<SseClient> {
        &self.client
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: Message) -> Result<()> {
        self.client.send(message)
    }

    async fn receive(&self) -> Result<JsonRpcRequest> {
        let mut requests = self.requests.lock().await;
        tokio::select! {
            _ = self.client.closed.cancelled() => Err(Error::EndOfStream),
            request = requests.recv() => request.ok_or(Error::EndOfStream),
        }
    }

    async fn close(&self) -> Result<()> {
        self.client.close();
        Ok(())
    }
}
