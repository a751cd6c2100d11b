//! Active call state and its event loop
//!
//! Every established call owns one task that consumes the endpoint events of
//! both sides in order. The task forwards local candidates to the browser that
//! owns the endpoint and feeds gathering notifications into the call's
//! [`RecordingGate`], so the decision to start the recorder is serialized per
//! call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backend::{EndpointEvent, MediaBackend};
use crate::relay::EventRelay;
use crate::restream::RestreamProcess;
use crate::types::{CallSide, CallState, ElementId, PipelineId, SessionId};

/// Media elements created for one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallElements {
    pub caller_endpoint: ElementId,
    pub callee_endpoint: ElementId,
    pub recorder: ElementId,
    /// Composite hub, when mixing
    pub hub: Option<ElementId>,
    /// RTP endpoint, when re-streaming
    pub rtp: Option<ElementId>,
}

impl CallElements {
    pub fn endpoint(&self, side: CallSide) -> &ElementId {
        match side {
            CallSide::Caller => &self.caller_endpoint,
            CallSide::Callee => &self.callee_endpoint,
        }
    }

    pub fn side_of(&self, element: &ElementId) -> Option<CallSide> {
        if element == &self.caller_endpoint {
            Some(CallSide::Caller)
        } else if element == &self.callee_endpoint {
            Some(CallSide::Callee)
        } else {
            None
        }
    }
}

/// Edge-triggered latch that fires once both sides finished gathering
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordingGate {
    caller_ready: bool,
    callee_ready: bool,
    fired: bool,
}

impl RecordingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `side` ready; true exactly once, on the transition to both-ready
    pub fn mark_ready(&mut self, side: CallSide) -> bool {
        match side {
            CallSide::Caller => self.caller_ready = true,
            CallSide::Callee => self.callee_ready = true,
        }
        if self.caller_ready && self.callee_ready && !self.fired {
            self.fired = true;
            return true;
        }
        false
    }

    pub fn is_ready(&self, side: CallSide) -> bool {
        match side {
            CallSide::Caller => self.caller_ready,
            CallSide::Callee => self.callee_ready,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// A call that owns a pipeline
#[derive(Debug)]
pub struct ActiveCall {
    pub caller: SessionId,
    pub callee: SessionId,
    pub pipeline: PipelineId,
    pub elements: CallElements,
    pub started_at: Instant,
    state: Mutex<CallState>,
    recording: AtomicBool,
    restream: Mutex<Option<RestreamProcess>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveCall {
    pub fn new(caller: SessionId, callee: SessionId, pipeline: PipelineId, elements: CallElements) -> Self {
        Self {
            caller,
            callee,
            pipeline,
            elements,
            started_at: Instant::now(),
            state: Mutex::new(CallState::Provisioning),
            recording: AtomicBool::new(false),
            restream: Mutex::new(None),
            event_task: Mutex::new(None),
        }
    }

    pub fn session(&self, side: CallSide) -> &SessionId {
        match side {
            CallSide::Caller => &self.caller,
            CallSide::Callee => &self.callee,
        }
    }

    /// The participant on the other side from `id`
    pub fn peer_of(&self, id: &SessionId) -> Option<&SessionId> {
        if id == &self.caller {
            Some(&self.callee)
        } else if id == &self.callee {
            Some(&self.caller)
        } else {
            None
        }
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// Move to `next` if that is a forward transition
    pub fn advance(&self, next: CallState) -> bool {
        let mut state = self.state.lock();
        let current = *state;
        if !current.can_advance_to(next) {
            tracing::trace!(pipeline = %self.pipeline, from = %current, to = %next, "Ignoring backward transition");
            return false;
        }
        tracing::debug!(pipeline = %self.pipeline, from = %current, to = %next, "Call state changed");
        *state = next;
        true
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    fn mark_recording(&self) {
        self.recording.store(true, Ordering::Release);
        self.advance(CallState::Recording);
    }

    /// Attach the re-stream process; hands it back if the call already ended
    pub fn set_restream(&self, process: RestreamProcess) -> Option<RestreamProcess> {
        let mut slot = self.restream.lock();
        if self.state().is_terminal() {
            return Some(process);
        }
        *slot = Some(process);
        None
    }

    pub fn take_restream(&self) -> Option<RestreamProcess> {
        self.restream.lock().take()
    }

    pub(crate) fn set_event_task(&self, handle: JoinHandle<()>) {
        *self.event_task.lock() = Some(handle);
    }

    pub(crate) fn take_event_task(&self) -> Option<JoinHandle<()>> {
        self.event_task.lock().take()
    }

    /// Spawn the task consuming this call's endpoint events
    ///
    /// `on_gathering_timeout` runs if the recording gate has not fired once
    /// `gathering_timeout` elapses; the loop stops afterwards.
    pub(crate) fn spawn_event_loop<F>(
        self: &Arc<Self>,
        events: mpsc::UnboundedReceiver<EndpointEvent>,
        relay: EventRelay,
        backend: Arc<dyn MediaBackend>,
        gathering_timeout: Option<Duration>,
        on_gathering_timeout: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        let call = self.clone();
        let span = tracing::info_span!("call_events", pipeline = %self.pipeline);
        let handle = tokio::spawn(
            async move {
                call.run_events(events, relay, backend, gathering_timeout, on_gathering_timeout)
                    .await;
            }
            .instrument(span),
        );
        self.set_event_task(handle);
    }

    async fn run_events<F>(
        &self,
        mut events: mpsc::UnboundedReceiver<EndpointEvent>,
        relay: EventRelay,
        backend: Arc<dyn MediaBackend>,
        gathering_timeout: Option<Duration>,
        on_gathering_timeout: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        let mut gate = RecordingGate::new();
        let deadline = gathering_timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let armed = deadline.filter(|_| !gate.has_fired());
            let timer = async move {
                match armed {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &mut gate, &relay, backend.as_ref()).await,
                    None => break,
                },
                _ = timer => {
                    tracing::warn!(
                        caller = %self.caller,
                        callee = %self.callee,
                        caller_ready = gate.is_ready(CallSide::Caller),
                        callee_ready = gate.is_ready(CallSide::Callee),
                        "Candidate gathering did not finish in time"
                    );
                    on_gathering_timeout();
                    break;
                }
            }
        }
        tracing::trace!("Call event loop finished");
    }

    async fn handle_event(
        &self,
        event: EndpointEvent,
        gate: &mut RecordingGate,
        relay: &EventRelay,
        backend: &dyn MediaBackend,
    ) {
        let Some(side) = self.elements.side_of(event.element()) else {
            tracing::debug!(element = %event.element(), "Event from an element outside this call");
            return;
        };

        match event {
            EndpointEvent::NewLocalCandidate { candidate, .. } => {
                relay.forward_local_candidate(self.session(side), candidate).await;
            }
            EndpointEvent::GatheringFinished { .. } => {
                tracing::debug!(%side, "Candidate gathering finished");
                if !gate.mark_ready(side) {
                    return;
                }
                match backend.start_recording(&self.elements.recorder).await {
                    Ok(()) => {
                        self.mark_recording();
                        tracing::info!(recorder = %self.elements.recorder, "Recording started");
                    }
                    Err(e) => {
                        tracing::warn!(recorder = %self.elements.recorder, "Failed to start recording: {}", e);
                    }
                }
            }
        }
    }
}
