//! Common test helpers for the call broker
//!
//! Provides a scripted [`MockBackend`] that records every operation, lets a
//! test raise endpoint events on the subscriptions the broker registered and
//! can be told to fail specific operations, plus a small client harness.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use rvoip_signaling_core::{
    BackendError, BackendResult, BrokerConfig, CallOffer, CallOrchestrator, ClientHandle, ElementId, ElementSpec,
    EndpointEvent, EndpointEventKind, EndpointEventSender, IceCandidate, MediaBackend, PipelineId, ServerMessage,
    SessionId,
};

/// One call made against the mock backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    CreatePipeline(PipelineId),
    CreateElement {
        pipeline: PipelineId,
        kind: &'static str,
        element: ElementId,
    },
    CreateHubPort {
        hub: ElementId,
        port: ElementId,
    },
    Connect {
        source: ElementId,
        sink: ElementId,
    },
    ProcessOffer {
        element: ElementId,
        offer: String,
    },
    GatherCandidates(ElementId),
    AddIceCandidate {
        element: ElementId,
        candidate: String,
    },
    Subscribe {
        element: ElementId,
        kind: EndpointEventKind,
    },
    StartRecording(ElementId),
    StopRecording(ElementId),
    Release(PipelineId),
}

#[derive(Default)]
struct MockState {
    ops: Vec<Op>,
    /// element → (pipeline, type name)
    elements: HashMap<ElementId, (PipelineId, &'static str)>,
    recorder_uris: HashMap<ElementId, String>,
    subscriptions: HashMap<(ElementId, EndpointEventKind), EndpointEventSender>,
    failing_ops: HashSet<&'static str>,
    failing_offers: HashSet<String>,
}

/// In-memory media backend
#[derive(Default)]
pub struct MockBackend {
    next_id: AtomicU64,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check(&self, op: &'static str) -> BackendResult<()> {
        if self.state.lock().failing_ops.contains(op) {
            return Err(BackendError::rejected(op, 40101, "scripted failure"));
        }
        Ok(())
    }

    fn record(&self, op: Op) {
        self.state.lock().ops.push(op);
    }

    /// Make every later call of `op` fail (`"create_pipeline"`, `"create_element"`, ...)
    pub fn fail_on(&self, op: &'static str) {
        self.state.lock().failing_ops.insert(op);
    }

    /// Make `process_offer` fail for this exact offer
    pub fn fail_offer(&self, offer: &str) {
        self.state.lock().failing_offers.insert(offer.to_string());
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    pub fn count(&self, predicate: impl Fn(&Op) -> bool) -> usize {
        self.state.lock().ops.iter().filter(|op| predicate(op)).count()
    }

    pub fn released(&self) -> Vec<PipelineId> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Release(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn recordings_started(&self) -> usize {
        self.count(|op| matches!(op, Op::StartRecording(_)))
    }

    /// Candidates handed to `element`, in delivery order
    pub fn added_candidates(&self, element: &ElementId) -> Vec<String> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::AddIceCandidate { element: e, candidate } if e == element => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Elements of `kind` created in `pipeline`, in creation order
    pub fn elements_of(&self, pipeline: &PipelineId, kind: &str) -> Vec<ElementId> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::CreateElement {
                    pipeline: p,
                    kind: k,
                    element,
                } if p == pipeline && *k == kind => Some(element.clone()),
                _ => None,
            })
            .collect()
    }

    /// The caller's and callee's WebRTC endpoints of `pipeline`
    pub fn endpoints(&self, pipeline: &PipelineId) -> (ElementId, ElementId) {
        let endpoints = self.elements_of(pipeline, "WebRtcEndpoint");
        assert_eq!(endpoints.len(), 2, "expected two WebRTC endpoints in {}", pipeline);
        (endpoints[0].clone(), endpoints[1].clone())
    }

    pub fn recorder_uri(&self, pipeline: &PipelineId) -> Option<String> {
        let recorder = self.elements_of(pipeline, "RecorderEndpoint").into_iter().next()?;
        self.state.lock().recorder_uris.get(&recorder).cloned()
    }

    /// Raise an event on the subscription the broker registered, if any
    pub fn emit(&self, event: EndpointEvent) -> bool {
        let key = (event.element().clone(), event.kind());
        let sender = self.state.lock().subscriptions.get(&key).cloned();
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    pub fn gathering_done(&self, element: &ElementId) -> bool {
        self.emit(EndpointEvent::GatheringFinished {
            element: element.clone(),
        })
    }

    pub fn local_candidate(&self, element: &ElementId, candidate: &str) -> bool {
        self.emit(EndpointEvent::NewLocalCandidate {
            element: element.clone(),
            candidate: IceCandidate::new(candidate),
        })
    }
}

#[async_trait]
impl MediaBackend for MockBackend {
    async fn create_pipeline(&self) -> BackendResult<PipelineId> {
        // A real media server round trip: lets concurrent accepts interleave
        tokio::task::yield_now().await;
        self.check("create_pipeline")?;
        let pipeline = PipelineId(self.next("pipeline"));
        self.record(Op::CreatePipeline(pipeline.clone()));
        Ok(pipeline)
    }

    async fn create_element(&self, pipeline: &PipelineId, spec: ElementSpec) -> BackendResult<ElementId> {
        self.check("create_element")?;
        let kind = spec.type_name();
        let element = ElementId(self.next(kind));
        let mut state = self.state.lock();
        if let ElementSpec::RecorderEndpoint { uri, .. } = &spec {
            state.recorder_uris.insert(element.clone(), uri.clone());
        }
        state.elements.insert(element.clone(), (pipeline.clone(), kind));
        state.ops.push(Op::CreateElement {
            pipeline: pipeline.clone(),
            kind,
            element: element.clone(),
        });
        Ok(element)
    }

    async fn create_hub_port(&self, hub: &ElementId) -> BackendResult<ElementId> {
        self.check("create_hub_port")?;
        let port = ElementId(self.next("HubPort"));
        let mut state = self.state.lock();
        if let Some((pipeline, _)) = state.elements.get(hub).cloned() {
            state.elements.insert(port.clone(), (pipeline, "HubPort"));
        }
        state.ops.push(Op::CreateHubPort {
            hub: hub.clone(),
            port: port.clone(),
        });
        Ok(port)
    }

    async fn connect(&self, source: &ElementId, sink: &ElementId) -> BackendResult<()> {
        self.check("connect")?;
        self.record(Op::Connect {
            source: source.clone(),
            sink: sink.clone(),
        });
        Ok(())
    }

    async fn process_offer(&self, element: &ElementId, offer: &str) -> BackendResult<String> {
        self.check("process_offer")?;
        if self.state.lock().failing_offers.contains(offer) {
            return Err(BackendError::rejected("processOffer", 40208, "SDP parse error"));
        }
        self.record(Op::ProcessOffer {
            element: element.clone(),
            offer: offer.to_string(),
        });
        Ok(format!("answer-to:{}", offer))
    }

    async fn gather_candidates(&self, element: &ElementId) -> BackendResult<()> {
        self.check("gather_candidates")?;
        self.record(Op::GatherCandidates(element.clone()));
        Ok(())
    }

    async fn add_ice_candidate(&self, element: &ElementId, candidate: &IceCandidate) -> BackendResult<()> {
        self.check("add_ice_candidate")?;
        self.record(Op::AddIceCandidate {
            element: element.clone(),
            candidate: candidate.candidate.clone(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        element: &ElementId,
        kind: EndpointEventKind,
        events: EndpointEventSender,
    ) -> BackendResult<()> {
        self.check("subscribe")?;
        let mut state = self.state.lock();
        state.subscriptions.insert((element.clone(), kind), events);
        state.ops.push(Op::Subscribe {
            element: element.clone(),
            kind,
        });
        Ok(())
    }

    async fn start_recording(&self, recorder: &ElementId) -> BackendResult<()> {
        self.check("start_recording")?;
        self.record(Op::StartRecording(recorder.clone()));
        Ok(())
    }

    async fn stop_recording(&self, recorder: &ElementId) -> BackendResult<()> {
        self.check("stop_recording")?;
        self.record(Op::StopRecording(recorder.clone()));
        Ok(())
    }

    async fn release(&self, pipeline: &PipelineId) -> BackendResult<()> {
        self.check("release")?;
        let mut state = self.state.lock();
        let owned: Vec<ElementId> = state
            .elements
            .iter()
            .filter(|(_, (p, _))| p == pipeline)
            .map(|(e, _)| e.clone())
            .collect();
        state.subscriptions.retain(|(element, _), _| !owned.contains(element));
        state.ops.push(Op::Release(pipeline.clone()));
        Ok(())
    }
}

/// Broker settings for tests: no timers unless a test opts in
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        ring_timeout_secs: None,
        gathering_timeout_secs: None,
        ..Default::default()
    }
}

pub fn setup(config: BrokerConfig) -> (Arc<MockBackend>, Arc<CallOrchestrator>) {
    let backend = MockBackend::new();
    let orchestrator = CallOrchestrator::new(backend.clone(), config);
    (backend, orchestrator)
}

/// A connected browser as seen from the broker
pub struct TestClient {
    pub id: SessionId,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl TestClient {
    /// Connect `id` and consume its `session-registered` greeting
    pub async fn connect(orchestrator: &CallOrchestrator, id: &str) -> Self {
        let (handle, mut rx) = ClientHandle::channel();
        orchestrator
            .connect(SessionId::from(id), handle)
            .await
            .expect("connect");
        match rx.try_recv() {
            Ok(ServerMessage::SessionRegistered(registered)) => assert_eq!(registered.session_id.as_str(), id),
            other => panic!("expected session-registered, got {:?}", other),
        }
        Self {
            id: SessionId::from(id),
            rx,
        }
    }

    /// Everything queued for this client so far
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Wait for the next message
    pub async fn next(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a server message")
            .expect("client channel closed")
    }
}

pub fn offer(caller: &TestClient, callee: &TestClient, sdp: &str) -> CallOffer {
    CallOffer {
        caller_id: caller.id.clone(),
        callee_id: callee.id.clone(),
        sdp: sdp.to_string(),
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Ring `callee` from `caller` and accept, returning the new pipeline
pub async fn establish(
    orchestrator: &CallOrchestrator,
    caller: &mut TestClient,
    callee: &mut TestClient,
) -> PipelineId {
    orchestrator
        .make_call(offer(caller, callee, "offer-from-caller"))
        .await
        .expect("make call");
    let pipeline = orchestrator
        .accept_call(offer(caller, callee, "offer-from-callee"))
        .await
        .expect("accept call");
    caller.drain();
    callee.drain();
    pipeline
}
