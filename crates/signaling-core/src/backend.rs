//! Media backend contract
//!
//! The broker never talks to a media server directly. Everything it needs is
//! expressed by [`MediaBackend`]: creating a pipeline and its elements, wiring
//! them, SDP offer processing, trickle ICE in both directions, recording, and
//! release. Backend-originated notifications are delivered as [`EndpointEvent`]
//! messages on the channel handed to [`MediaBackend::subscribe`], so each call
//! consumes its own events in order.

use crate::types::{ElementId, IceCandidate, PipelineId};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Failures reported by a media backend
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{operation} rejected by media server (code {code}): {message}")]
    Rejected {
        operation: String,
        code: i64,
        message: String,
    },

    #[error("Media server transport error: {message}")]
    Transport { message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Media server connection closed")]
    Closed,

    #[error("Unexpected response to {operation}: {message}")]
    Protocol { operation: String, message: String },
}

impl BackendError {
    pub fn rejected(operation: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            code,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn protocol(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Media elements the broker creates inside a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementSpec {
    /// Bidirectional WebRTC endpoint facing one browser
    WebRtcEndpoint,
    /// Recording sink writing to `uri`
    RecorderEndpoint {
        uri: String,
        media_profile: Option<String>,
    },
    /// Routing hub mixing every hub port connected to it
    Composite,
    /// Plain RTP endpoint used to hand the mixed call to an external process
    RtpEndpoint,
}

impl ElementSpec {
    /// Backend type name of the element
    pub fn type_name(&self) -> &'static str {
        match self {
            ElementSpec::WebRtcEndpoint => "WebRtcEndpoint",
            ElementSpec::RecorderEndpoint { .. } => "RecorderEndpoint",
            ElementSpec::Composite => "Composite",
            ElementSpec::RtpEndpoint => "RtpEndpoint",
        }
    }
}

/// Kinds of endpoint notifications the broker subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointEventKind {
    /// The endpoint discovered a local candidate
    NewLocalCandidate,
    /// The endpoint finished gathering candidates
    GatheringFinished,
}

/// A notification raised by a backend endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    NewLocalCandidate {
        element: ElementId,
        candidate: IceCandidate,
    },
    GatheringFinished {
        element: ElementId,
    },
}

impl EndpointEvent {
    pub fn element(&self) -> &ElementId {
        match self {
            EndpointEvent::NewLocalCandidate { element, .. } => element,
            EndpointEvent::GatheringFinished { element } => element,
        }
    }

    pub fn kind(&self) -> EndpointEventKind {
        match self {
            EndpointEvent::NewLocalCandidate { .. } => EndpointEventKind::NewLocalCandidate,
            EndpointEvent::GatheringFinished { .. } => EndpointEventKind::GatheringFinished,
        }
    }
}

/// Channel end on which a backend delivers endpoint notifications
pub type EndpointEventSender = mpsc::UnboundedSender<EndpointEvent>;

/// Asynchronous media backend (a Kurento Media Server in production)
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Create an empty media pipeline
    async fn create_pipeline(&self) -> BackendResult<PipelineId>;

    /// Create an element inside `pipeline`
    async fn create_element(&self, pipeline: &PipelineId, spec: ElementSpec) -> BackendResult<ElementId>;

    /// Create a port on a composite hub
    async fn create_hub_port(&self, hub: &ElementId) -> BackendResult<ElementId>;

    /// Send media from `source` to `sink`
    async fn connect(&self, source: &ElementId, sink: &ElementId) -> BackendResult<()>;

    /// Process an SDP offer on `element` and return the answer
    async fn process_offer(&self, element: &ElementId, offer: &str) -> BackendResult<String>;

    /// Start local candidate gathering on a WebRTC endpoint
    async fn gather_candidates(&self, element: &ElementId) -> BackendResult<()>;

    /// Hand a remote candidate to a WebRTC endpoint
    async fn add_ice_candidate(&self, element: &ElementId, candidate: &IceCandidate) -> BackendResult<()>;

    /// Deliver `kind` notifications raised by `element` on `events`
    async fn subscribe(
        &self,
        element: &ElementId,
        kind: EndpointEventKind,
        events: EndpointEventSender,
    ) -> BackendResult<()>;

    /// Start a recorder
    async fn start_recording(&self, recorder: &ElementId) -> BackendResult<()>;

    /// Stop a recorder, flushing the artifact
    async fn stop_recording(&self, recorder: &ElementId) -> BackendResult<()>;

    /// Release a pipeline and every element inside it
    async fn release(&self, pipeline: &PipelineId) -> BackendResult<()>;
}
