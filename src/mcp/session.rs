//! Session lifecycle and session manager.
//!
//! A session tracks one logical client connection through
//! `new → initialized → ready → active → closed`. The manager owns every
//! session, refreshes activity on lookup, and sweeps idle sessions in the
//! background.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mcp::protocol::ClientInfo;

/// Default idle timeout before a session is swept.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default interval between idle sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Protocol lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Initialized,
    Ready,
    Active,
    Closed,
}

impl SessionState {
    /// Whether `self → next` is a legal transition. `Closed` is terminal.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (New, Initialized)
                | (New, Closed)
                | (Initialized, Ready)
                | (Initialized, Closed)
                | (Ready, Active)
                | (Ready, Closed)
                | (Active, Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::Initialized => "initialized",
            SessionState::Ready => "ready",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport that created the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Stdio,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Http => "http",
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
        };
        f.write_str(s)
    }
}

/// Mutable session fields, guarded by the per-session lock.
#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    client_info: Option<ClientInfo>,
    last_activity: Instant,
}

/// One logical client connection.
#[derive(Debug)]
pub struct Session {
    id: String,
    transport: TransportKind,
    created_at: DateTime<Utc>,
    inner: RwLock<SessionInner>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session in state `new`.
    pub fn new(id: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            transport,
            created_at: Utc::now(),
            inner: RwLock::new(SessionInner {
                state: SessionState::New,
                client_info: None,
                last_activity: Instant::now(),
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    /// Move to `next`, leaving the state untouched if the move is illegal.
    ///
    /// Moving to `Closed` cancels the execution scope, as [`Session::close`] does.
    pub async fn transition(&self, next: SessionState) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: inner.state,
                to: next,
            });
        }
        debug!(session = %self.id, from = %inner.state, to = %next, "Session transition");
        inner.state = next;
        inner.last_activity = Instant::now();
        drop(inner);

        if next == SessionState::Closed {
            self.cancel.cancel();
        }
        Ok(())
    }

    /// Record the client metadata negotiated by `initialize`.
    pub async fn set_client_info(&self, info: ClientInfo) {
        let mut inner = self.inner.write().await;
        inner.client_info = Some(info);
        inner.last_activity = Instant::now();
    }

    pub async fn client_info(&self) -> Option<ClientInfo> {
        self.inner.read().await.client_info.clone()
    }

    /// Refresh the last-activity timestamp.
    pub async fn touch(&self) {
        self.inner.write().await.last_activity = Instant::now();
    }

    /// Time since the last recorded activity.
    pub async fn idle_time(&self) -> Duration {
        self.inner.read().await.last_activity.elapsed()
    }

    pub async fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_time().await > timeout
    }

    /// Close the session and cancel its execution scope.
    ///
    /// Returns `false` if the session was already closed.
    pub async fn close(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.state == SessionState::Closed {
            return false;
        }
        inner.state = SessionState::Closed;
        drop(inner);
        self.cancel.cancel();
        true
    }

    /// Cancellation scope for work bound to this session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Generate a new session id.
pub fn generate_session_id() -> String {
    format!("mcp-session-{}", Uuid::new_v4())
}

type SessionMap = Arc<RwLock<HashMap<String, Arc<Session>>>>;

/// Owner of all sessions.
pub struct SessionManager {
    sessions: SessionMap,
    timeout: Duration,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a manager and start its idle sweep. Must be called inside a
    /// tokio runtime.
    pub fn new(timeout: Duration, sweep_interval: Duration) -> Self {
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(sweep_loop(
            sessions.clone(),
            timeout,
            sweep_interval,
            shutdown.clone(),
        ));

        Self {
            sessions,
            timeout,
            shutdown,
            sweeper: Mutex::new(Some(handle)),
        }
    }

    /// Create a session in state `new`, replacing any session with the same id.
    pub async fn create_session(
        &self,
        id: impl Into<String>,
        transport: TransportKind,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(id, transport));
        let previous = self
            .sessions
            .write()
            .await
            .insert(session.id().to_string(), session.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }
        debug!(session = %session.id(), transport = %transport, "Session created");
        session
    }

    /// Look up a session, refreshing its last activity on hit.
    pub async fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(id).cloned()?;
        session.touch().await;
        Some(session)
    }

    /// Close and remove a session. Closing an already-removed session is a no-op.
    pub async fn remove_session(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.close().await;
                debug!(session = %id, "Session removed");
                true
            }
            None => false,
        }
    }

    /// Ids of all live sessions.
    pub async fn list_sessions(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Close and remove every session idle for longer than the timeout.
    pub async fn sweep_expired(&self) -> usize {
        sweep_once(&self.sessions, self.timeout).await
    }

    /// Stop the sweep and close every remaining session.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }

        let drained: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close().await;
        }
        info!(closed = drained.len(), "Session manager closed");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sweep_loop(
    sessions: SessionMap,
    timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let swept = sweep_once(&sessions, timeout).await;
                if swept > 0 {
                    info!(swept, "Swept idle sessions");
                }
            }
        }
    }
}

/// Runs under the map's write lock, so it excludes lookups, creation and
/// removal for its duration.
async fn sweep_once(sessions: &SessionMap, timeout: Duration) -> usize {
    let mut map = sessions.write().await;

    let mut expired = Vec::new();
    for (id, session) in map.iter() {
        if session.is_expired(timeout).await {
            expired.push(id.clone());
        }
    }

    for id in &expired {
        if let Some(session) = map.remove(id) {
            session.close().await;
            debug!(session = %id, "Expired idle session");
        }
    }

    expired.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use SessionState::*;
        assert!(New.can_transition_to(Initialized));
        assert!(New.can_transition_to(Closed));
        assert!(Initialized.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Active));
        assert!(Active.can_transition_to(Closed));

        assert!(!New.can_transition_to(Ready));
        assert!(!Active.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Initialized));
        for next in [New, Initialized, Ready, Active, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let session = Session::new("s1", TransportKind::Http);
        let token = session.cancellation_token();
        assert_eq!(session.state().await, SessionState::New);

        session.transition(SessionState::Initialized).await.unwrap();
        session.transition(SessionState::Ready).await.unwrap();
        session.transition(SessionState::Active).await.unwrap();
        assert!(!token.is_cancelled());

        session.transition(SessionState::Closed).await.unwrap();
        assert_eq!(session.state().await, SessionState::Closed);
        assert!(token.is_cancelled());
        assert!(!session.close().await);
    }

    #[tokio::test]
    async fn test_skipping_initialized_is_rejected() {
        let session = Session::new("s1", TransportKind::Stdio);
        let err = session.transition(SessionState::Ready).await.unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: SessionState::New,
                to: SessionState::Ready
            }
        ));
        assert_eq!(session.state().await, SessionState::New);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels() {
        let session = Session::new("s1", TransportKind::Sse);
        let token = session.cancellation_token();

        assert!(session.close().await);
        assert!(token.is_cancelled());
        assert!(!session.close().await);
        assert!(session.transition(SessionState::Closed).await.is_err());
    }

    #[tokio::test]
    async fn test_client_info_capture() {
        let session = Session::new("s1", TransportKind::Http);
        assert!(session.client_info().await.is_none());

        session
            .set_client_info(ClientInfo {
                name: "claude".to_string(),
                version: "1.0".to_string(),
            })
            .await;
        assert_eq!(session.client_info().await.unwrap().name, "claude");
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id();
        assert!(id.starts_with("mcp-session-"));
        assert_ne!(id, generate_session_id());
    }

    #[tokio::test]
    async fn test_manager_create_get_remove() {
        let manager = SessionManager::new(DEFAULT_SESSION_TIMEOUT, DEFAULT_SWEEP_INTERVAL);
        let session = manager.create_session("abc", TransportKind::Http).await;
        let token = session.cancellation_token();

        assert_eq!(manager.session_count().await, 1);
        assert!(manager.get_session("abc").await.is_some());
        assert!(manager.get_session("missing").await.is_none());

        assert!(manager.remove_session("abc").await);
        assert!(!manager.remove_session("abc").await);
        assert!(token.is_cancelled());
        assert_eq!(manager.session_count().await, 0);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_sessions() {
        let manager = SessionManager::new(Duration::from_millis(20), Duration::from_secs(3600));
        let session = manager.create_session("idle", TransportKind::Http).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.sweep_expired().await, 1);
        assert!(manager.get_session("idle").await.is_none());
        assert_eq!(session.state().await, SessionState::Closed);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_background_sweep_runs_on_interval() {
        let manager = SessionManager::new(Duration::from_millis(10), Duration::from_millis(30));
        manager.create_session("idle", TransportKind::Stdio).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.list_sessions().await.is_empty());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_get_session_refreshes_activity() {
        let manager = SessionManager::new(Duration::from_millis(60), Duration::from_secs(3600));
        manager.create_session("busy", TransportKind::Http).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(manager.get_session("busy").await.is_some());
        }
        assert_eq!(manager.sweep_expired().await, 0);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_manager_close_closes_all() {
        let manager = SessionManager::new(DEFAULT_SESSION_TIMEOUT, DEFAULT_SWEEP_INTERVAL);
        let a = manager.create_session("a", TransportKind::Http).await;
        let b = manager.create_session("b", TransportKind::Sse).await;

        manager.close().await;

        assert_eq!(manager.session_count().await, 0);
        assert_eq!(a.state().await, SessionState::Closed);
        assert_eq!(b.state().await, SessionState::Closed);
    }
}
