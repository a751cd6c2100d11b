//! Call Orchestrator
//!
//! Owns every piece of broker state (the session registry, candidate
//! buffers, ringing calls and active calls) and drives the call state
//! machine in response to client messages and transport lifecycle events.
//!
//! The flows live in submodules:
//! - [`call`]: per-call state, the recording gate and the event loop
//! - `provision`: accepting a call and building its media pipeline
//! - `teardown`: stopping calls, disconnects and timeouts

pub mod call;
mod provision;
mod teardown;

pub use call::{ActiveCall, CallElements, RecordingGate};

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backend::MediaBackend;
use crate::candidates::CandidateBuffer;
use crate::config::BrokerConfig;
use crate::errors::{BrokerError, Result};
use crate::pairing::resolve_pair;
use crate::protocol::{CallEndReason, CallOffer, CandidateMessage, ClientMessage, Registered, ServerMessage};
use crate::registry::{ClientHandle, RegistryStats, SessionRegistry};
use crate::relay::EventRelay;
use crate::restream::Restreamer;
use crate::types::{CallState, IceCandidate, PipelineId, SessionId};

/// Result of a `stop-call` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The shared pipeline was torn down
    Released(PipelineId),
    /// The pair had no call; nothing was touched
    NoActiveCall,
}

/// Snapshot of broker activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub active_calls: usize,
    pub ringing_calls: usize,
    pub sessions: RegistryStats,
}

type PairKey = (SessionId, SessionId);

/// A call offered by the caller and not yet accepted
#[derive(Debug)]
struct PendingCall {
    offered_at: Instant,
    ring_timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }
}

/// The signaling state machine
pub struct CallOrchestrator {
    backend: Arc<dyn MediaBackend>,
    config: BrokerConfig,
    registry: Arc<SessionRegistry>,
    candidates: Arc<CandidateBuffer>,
    relay: EventRelay,
    pending: DashMap<PairKey, PendingCall>,
    calls: DashMap<PipelineId, Arc<ActiveCall>>,
    /// Sessions claimed by a call, from acceptance until teardown
    engaged: Mutex<HashSet<SessionId>>,
    restreamer: Option<Restreamer>,
    weak_self: Weak<CallOrchestrator>,
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("topology", &self.config.topology)
            .field("ringing_calls", &self.pending.len())
            .field("active_calls", &self.calls.len())
            .finish()
    }
}

impl CallOrchestrator {
    pub fn new(backend: Arc<dyn MediaBackend>, config: BrokerConfig) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let candidates = Arc::new(CandidateBuffer::with_limit(config.max_pending_candidates));
        let relay = EventRelay::new(registry.clone(), candidates.clone());
        let restreamer = config.restream.clone().map(Restreamer::new);

        tracing::info!(
            topology = ?config.topology,
            restream = restreamer.is_some(),
            "Call orchestrator created"
        );

        Arc::new_cyclic(|weak_self| Self {
            backend,
            config,
            registry,
            candidates,
            relay,
            pending: DashMap::new(),
            calls: DashMap::new(),
            engaged: Mutex::new(HashSet::new()),
            restreamer,
            weak_self: weak_self.clone(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn candidates(&self) -> &Arc<CandidateBuffer> {
        &self.candidates
    }

    /// Register a new connection and greet it with its session id
    pub async fn connect(&self, id: SessionId, client: ClientHandle) -> Result<()> {
        let session = self.registry.register(id.clone(), client).await?;
        session.client.send(ServerMessage::SessionRegistered(Registered { session_id: id.clone() }));
        tracing::info!(session_id = %id, "Client connected");
        Ok(())
    }

    /// Dispatch one message received on `from`'s connection
    ///
    /// `client-accept-call` runs on its own task; everything else completes
    /// before this returns. Errors are logged here and never reach the caller
    /// since clients have already been told whatever they need to know.
    pub async fn handle_client_message(&self, from: &SessionId, message: ClientMessage) {
        tracing::debug!(session_id = %from, event = message.name(), "Client message");

        let result = match message {
            ClientMessage::ClientMakeCall(offer) => self.make_call(offer).await,
            ClientMessage::ClientAcceptCall(offer) => {
                self.spawn_accept(offer);
                Ok(())
            }
            ClientMessage::ClientSendIceCandidate(CandidateMessage { candidate }) => {
                self.add_remote_candidate(from, candidate).await;
                Ok(())
            }
            ClientMessage::StopCall(parties) => self
                .stop_call(from, &parties.caller_id, &parties.callee_id)
                .await
                .map(|_| ()),
        };

        if let Err(e) = result {
            log_failure(from, &e);
        }
    }

    fn spawn_accept(&self, offer: CallOffer) -> Option<JoinHandle<()>> {
        let this = self.weak_self.upgrade()?;
        let span = tracing::info_span!("accept_call", caller = %offer.caller_id, callee = %offer.callee_id);
        let callee = offer.callee_id.clone();
        Some(tokio::spawn(
            async move {
                if let Err(e) = this.accept_call(offer).await {
                    log_failure(&callee, &e);
                }
            }
            .instrument(span),
        ))
    }

    /// Caller offers a call: remember the offer and ring the callee
    pub async fn make_call(&self, offer: CallOffer) -> Result<()> {
        let CallOffer { caller_id, callee_id, sdp } = offer;
        resolve_pair(&self.registry, &caller_id, &callee_id).await?;
        if caller_id == callee_id {
            let error = BrokerError::SelfCall {
                session_id: caller_id.clone(),
            };
            self.notify_error(&caller_id, &error).await;
            return Err(error);
        }
        self.registry.set_offer(&caller_id, sdp).await?;

        // Anything queued now was trickled by an earlier peer connection
        for id in [&caller_id, &callee_id] {
            if !self.is_engaged(id) {
                let discarded = self.candidates.clear_pending(id);
                if discarded > 0 {
                    tracing::debug!(session_id = %id, discarded, "Dropped stale candidates");
                }
            }
        }

        let key = (caller_id.clone(), callee_id.clone());
        let ring_timer = self.config.ring_timeout().map(|timeout| {
            let weak = self.weak_self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(this) = weak.upgrade() {
                    this.expire_ringing(&key.0, &key.1).await;
                }
            })
        });

        let pending = PendingCall {
            offered_at: Instant::now(),
            ring_timer,
        };
        if let Some(mut previous) = self.pending.insert(key, pending) {
            previous.cancel_timer();
            tracing::debug!(caller = %caller_id, callee = %callee_id, "Replaced earlier offer");
        }

        self.registry
            .send_to(&callee_id, ServerMessage::incoming_call(&caller_id, &callee_id))
            .await;
        tracing::info!(caller = %caller_id, callee = %callee_id, "Ringing");
        Ok(())
    }

    /// Route a browser's candidate to its endpoint, or buffer it
    pub async fn add_remote_candidate(&self, from: &SessionId, candidate: IceCandidate) {
        if !self.registry.contains(from).await {
            tracing::debug!(session_id = %from, "Dropping candidate from unregistered session");
            return;
        }
        self.relay.accept_remote_candidate(from, candidate);
    }

    /// Remove a ringing entry, stopping its timer
    fn take_pending(&self, caller: &SessionId, callee: &SessionId) -> Option<PendingCall> {
        let (_, mut pending) = self.pending.remove(&(caller.clone(), callee.clone()))?;
        pending.cancel_timer();
        Some(pending)
    }

    /// Claim both participants for a call being accepted
    ///
    /// Fails with the first participant that is already claimed; nothing is
    /// claimed in that case.
    fn engage(&self, caller: &SessionId, callee: &SessionId) -> std::result::Result<(), SessionId> {
        let mut engaged = self.engaged.lock();
        if let Some(busy) = [caller, callee].into_iter().find(|id| engaged.contains(*id)) {
            return Err(busy.clone());
        }
        engaged.insert(caller.clone());
        engaged.insert(callee.clone());
        Ok(())
    }

    fn disengage(&self, caller: &SessionId, callee: &SessionId) {
        let mut engaged = self.engaged.lock();
        engaged.remove(caller);
        engaged.remove(callee);
    }

    /// Whether the session is being provisioned into, or is in, a call
    pub fn is_engaged(&self, id: &SessionId) -> bool {
        self.engaged.lock().contains(id)
    }

    pub fn is_ringing(&self, caller: &SessionId, callee: &SessionId) -> bool {
        self.pending.contains_key(&(caller.clone(), callee.clone()))
    }

    pub fn call(&self, pipeline: &PipelineId) -> Option<Arc<ActiveCall>> {
        self.calls.get(pipeline).map(|entry| entry.value().clone())
    }

    pub fn call_state(&self, pipeline: &PipelineId) -> Option<CallState> {
        self.calls.get(pipeline).map(|entry| entry.state())
    }

    pub fn active_calls(&self) -> Vec<PipelineId> {
        self.calls.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            active_calls: self.calls.len(),
            ringing_calls: self.pending.len(),
            sessions: self.registry.stats().await,
        }
    }

    async fn notify_ended(&self, to: &[&SessionId], caller: &SessionId, callee: &SessionId, reason: CallEndReason) {
        for id in to {
            self.registry
                .send_to(id, ServerMessage::call_ended(caller, callee, reason))
                .await;
        }
    }

    async fn notify_error(&self, to: &SessionId, error: &BrokerError) {
        self.registry.send_to(to, ServerMessage::call_error(error.to_string())).await;
    }
}

fn log_failure(session_id: &SessionId, error: &BrokerError) {
    if error.is_silent() {
        tracing::debug!(session_id = %session_id, "Ignoring request: {}", error);
    } else {
        tracing::warn!(session_id = %session_id, "Request failed: {}", error);
    }
}
