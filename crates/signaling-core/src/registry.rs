//! Session Registry
//!
//! Maps connection identities to their session state. The registry is the
//! lifecycle anchor of the broker: a session exists from the moment its
//! connection is accepted until the transport reports the disconnect.
//! Removing a session never touches media resources; releasing pipelines is
//! the orchestrator's job.

use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};

use crate::errors::{BrokerError, Result};
use crate::protocol::ServerMessage;
use crate::types::{ElementId, PipelineId, SessionId};

/// Outbound half of a client connection
///
/// The transport owns the receiving end and writes whatever arrives here to
/// the socket; the broker only keeps clones of the sender.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { tx }
    }

    /// Create a handle together with the receiver the transport drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queue a message for the client; false if the connection is gone
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// State kept for one connected client
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub client: ClientHandle,
    /// Pipelines this session currently participates in
    pub pipelines: Vec<PipelineId>,
    /// Local media endpoint serving this session, while in a call
    pub endpoint: Option<ElementId>,
    /// Most recently received SDP offer
    pub sdp: Option<String>,
    pub created_at: Instant,
    pub updated_at: Instant,
}

impl Session {
    pub fn new(id: SessionId, client: ClientHandle) -> Self {
        let now = Instant::now();
        Self {
            id,
            client,
            pipelines: Vec::new(),
            endpoint: None,
            sdp: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn in_call(&self) -> bool {
        self.endpoint.is_some()
    }

    fn touch(&mut self) {
        self.updated_at = Instant::now();
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub sessions_in_call: usize,
    pub total_registered: usize,
    pub total_removed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_registered: usize,
    total_removed: usize,
}

/// Lock-guarded store of every connected session
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
    counters: RwLock<Counters>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection
    ///
    /// A duplicate id means the transport handed out the same identity twice.
    pub async fn register(&self, id: SessionId, client: ClientHandle) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(BrokerError::SessionAlreadyRegistered { session_id: id });
        }

        let session = Session::new(id.clone(), client);
        sessions.insert(id.clone(), session.clone());
        self.counters.write().await.total_registered += 1;

        tracing::debug!(session_id = %id, "Registered session");
        Ok(session)
    }

    /// Snapshot of a session, if it is still connected
    pub async fn lookup(&self, id: &SessionId) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Forget a session; its pipelines are left alone
    pub async fn remove(&self, id: &SessionId) -> Option<Session> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            self.counters.write().await.total_removed += 1;
            tracing::debug!(session_id = %id, "Removed session");
        }
        removed
    }

    /// Run `f` against the live session entry
    pub async fn with_session_mut<F, R>(&self, id: &SessionId, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) => {
                let result = f(session);
                session.touch();
                Ok(result)
            }
            None => Err(BrokerError::unknown_participant(id)),
        }
    }

    /// Store the most recent SDP offer received from `id`
    pub async fn set_offer(&self, id: &SessionId, sdp: String) -> Result<()> {
        self.with_session_mut(id, |session| session.sdp = Some(sdp)).await
    }

    /// Record that `id` takes part in `pipeline` through `endpoint`
    pub async fn attach_call(&self, id: &SessionId, pipeline: &PipelineId, endpoint: &ElementId) -> Result<()> {
        self.with_session_mut(id, |session| {
            if !session.pipelines.contains(pipeline) {
                session.pipelines.push(pipeline.clone());
            }
            session.endpoint = Some(endpoint.clone());
        })
        .await
    }

    /// Drop the reference to `pipeline` and clear the endpoint it provided
    ///
    /// Returns false when the session is already gone.
    pub async fn detach_pipeline(&self, id: &SessionId, pipeline: &PipelineId) -> bool {
        self.with_session_mut(id, |session| {
            session.pipelines.retain(|p| p != pipeline);
            session.endpoint = None;
        })
        .await
        .is_ok()
    }

    /// Queue a message for `id`; false when the session is unknown or its connection closed
    pub async fn send_to(&self, id: &SessionId, message: ServerMessage) -> bool {
        match self.sessions.read().await.get(id) {
            Some(session) => session.client.send(message),
            None => false,
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read().await;
        let counters = self.counters.read().await;
        RegistryStats {
            active_sessions: sessions.len(),
            sessions_in_call: sessions.values().filter(|s| s.in_call()).count(),
            total_registered: counters.total_registered,
            total_removed: counters.total_removed,
        }
    }
}
