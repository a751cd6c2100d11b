//! Kurento JSON-RPC client
//!
//! One WebSocket connection to the media server. Requests are written by a
//! writer task; a reader task feeds incoming frames to the dispatcher, which
//! completes pending requests by id and routes `onEvent` notifications to the
//! channel registered for the element and event kind.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use rvoip_signaling_core::{ElementId, EndpointEvent, EndpointEventKind, EndpointEventSender, PipelineId};

use crate::error::{KurentoError, Result};
use crate::jsonrpc::{self, Incoming, Request};

/// Connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KurentoConfig {
    /// WebSocket URL of the media server
    pub url: String,
    /// How long a request may wait for its response
    pub request_timeout_ms: u64,
    /// Keep-alive `ping` period; disabled when unset
    pub ping_interval_secs: Option<u64>,
}

impl Default for KurentoConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8888/kurento".to_string(),
            request_timeout_ms: 20_000,
            ping_interval_secs: Some(30),
        }
    }
}

impl KurentoConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// Client for one media server connection
pub struct KurentoClient {
    config: KurentoConfig,
    outbound: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
    session_id: RwLock<Option<String>>,
    pub(crate) subscriptions: DashMap<(ElementId, EndpointEventKind), EndpointEventSender>,
    /// element → owning pipeline, so a release can drop its subscriptions
    pub(crate) elements: DashMap<ElementId, PipelineId>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for KurentoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KurentoClient")
            .field("url", &self.config.url)
            .field("session_id", &*self.session_id.read())
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl KurentoClient {
    /// Open the WebSocket connection and start the I/O tasks
    pub async fn connect(config: KurentoConfig) -> Result<Arc<Self>> {
        let (stream, _) = connect_async(config.url.as_str())
            .await
            .map_err(|e| KurentoError::Connect {
                url: config.url.clone(),
                message: e.to_string(),
            })?;
        let (mut ws_write, mut ws_read) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = ws_write.send(Message::Text(text)).await {
                    tracing::warn!("Media server write failed: {}", e);
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("Media server connection error: {}", e);
                        break;
                    }
                };
                if inbound_tx.send(text).is_err() {
                    break;
                }
            }
            tracing::debug!("Media server reader finished");
        });

        tracing::info!(url = %config.url, "Connected to media server");
        let client = Self::with_transport(config, outbound_tx, inbound_rx);
        client.tasks.lock().extend([writer, reader]);
        Ok(client)
    }

    /// Run the client over an already established text-frame transport
    pub fn with_transport(
        config: KurentoConfig,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Arc<Self> {
        let ping_interval = config.ping_interval_secs.map(Duration::from_secs);
        let client = Arc::new(Self {
            config,
            outbound,
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            session_id: RwLock::new(None),
            subscriptions: DashMap::new(),
            elements: DashMap::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let dispatcher = tokio::spawn(Self::dispatch(Arc::downgrade(&client), inbound));
        client.tasks.lock().push(dispatcher);

        if let Some(period) = ping_interval {
            let keepalive = tokio::spawn(Self::keepalive(Arc::downgrade(&client), period));
            client.tasks.lock().push(keepalive);
        }
        client
    }

    pub fn config(&self) -> &KurentoConfig {
        &self.config
    }

    /// Session id assigned by the media server, once known
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its result
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(KurentoError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let text = serde_json::to_string(&Request::new(id, method, params))?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );

        if self.outbound.send(text).is_err() {
            self.pending.remove(&id);
            return Err(KurentoError::Closed);
        }
        tracing::trace!(id, method, "Request sent");

        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(KurentoError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(KurentoError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.config.request_timeout_ms,
                })
            }
        }
    }

    /// `create` a media object and return its id
    pub async fn create(&self, kind: &str, constructor_params: Value) -> Result<String> {
        let session = self.session_id();
        let params = jsonrpc::create_params(kind, constructor_params, session.as_deref());
        let result = self.request("create", params).await?;
        string_value("create", &result)
    }

    /// `invoke` an operation and return its `value` (null when there is none)
    pub async fn invoke(&self, object: &str, operation: &str, operation_params: Value) -> Result<Value> {
        let session = self.session_id();
        let params = jsonrpc::invoke_params(object, operation, operation_params, session.as_deref());
        let result = self.request("invoke", params).await?;
        Ok(result.get("value").cloned().unwrap_or(Value::Null))
    }

    /// `subscribe` to an element event, returning the subscription id
    pub async fn subscribe_event(&self, object: &str, event: &str) -> Result<String> {
        let session = self.session_id();
        let params = jsonrpc::subscribe_params(object, event, session.as_deref());
        let result = self.request("subscribe", params).await?;
        string_value("subscribe", &result)
    }

    /// `release` a media object and everything it owns
    pub async fn release_object(&self, object: &str) -> Result<()> {
        let session = self.session_id();
        self.request("release", jsonrpc::release_params(object, session.as_deref()))
            .await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let interval_ms = self
            .config
            .ping_interval_secs
            .map(|s| s * 1000)
            .unwrap_or(240_000);
        self.request("ping", jsonrpc::ping_params(interval_ms)).await?;
        Ok(())
    }

    /// Fail every pending request and stop the I/O tasks
    pub fn close(&self) {
        self.mark_closed();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn dispatch(client: Weak<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = inbound.recv().await {
            let Some(client) = client.upgrade() else {
                return;
            };
            client.handle_incoming(&text);
        }
        if let Some(client) = client.upgrade() {
            tracing::warn!(url = %client.config.url, "Media server connection closed");
            client.mark_closed();
        }
    }

    async fn keepalive(client: Weak<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(client) = client.upgrade() else {
                return;
            };
            if client.is_closed() {
                return;
            }
            if let Err(e) = client.ping().await {
                tracing::warn!("Media server ping failed: {}", e);
            }
        }
    }

    fn handle_incoming(&self, text: &str) {
        let incoming = match Incoming::parse(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!("Ignoring malformed frame from media server: {}", e);
                return;
            }
        };

        match incoming {
            Incoming::Response { id, outcome } => {
                let Some((_, pending)) = self.pending.remove(&id) else {
                    tracing::debug!(id, "Response for unknown or expired request");
                    return;
                };
                let outcome = match outcome {
                    Ok(result) => {
                        self.track_session(&result);
                        Ok(result)
                    }
                    Err(error) => Err(KurentoError::Rpc {
                        method: pending.method,
                        code: error.code,
                        message: error.message,
                    }),
                };
                let _ = pending.tx.send(outcome);
            }
            Incoming::Notification { method, params } if method == "onEvent" => {
                self.route_event(&params);
            }
            Incoming::Notification { method, .. } => {
                tracing::trace!(method = %method, "Ignoring notification");
            }
        }
    }

    fn track_session(&self, result: &Value) {
        let Some(session_id) = result.get("sessionId").and_then(Value::as_str) else {
            return;
        };
        let mut current = self.session_id.write();
        if current.as_deref() != Some(session_id) {
            tracing::debug!(session_id, "Media server session assigned");
            *current = Some(session_id.to_string());
        }
    }

    fn route_event(&self, params: &Value) {
        let Some(event) = jsonrpc::parse_event(params) else {
            tracing::trace!("Ignoring unsubscribed event");
            return;
        };
        let element = ElementId(event.object);
        let key = (element.clone(), event.kind);
        let Some(sender) = self.subscriptions.get(&key).map(|s| s.value().clone()) else {
            tracing::trace!(element = %element, kind = ?event.kind, "No subscriber for event");
            return;
        };

        let endpoint_event = match (event.kind, event.candidate) {
            (EndpointEventKind::NewLocalCandidate, Some(candidate)) => {
                EndpointEvent::NewLocalCandidate { element, candidate }
            }
            (EndpointEventKind::NewLocalCandidate, None) => return,
            (EndpointEventKind::GatheringFinished, _) => EndpointEvent::GatheringFinished { element },
        };
        if sender.send(endpoint_event).is_err() {
            self.subscriptions.remove(&key);
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(KurentoError::Closed));
            }
        }
        self.subscriptions.clear();
    }
}

impl Drop for KurentoClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn string_value(method: &str, result: &Value) -> Result<String> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| KurentoError::protocol(method, format!("expected a string value, got {}", result)))
}
