//! Call-signaling broker for two-party WebRTC calls.
//!
//! Browsers exchange signaling messages with the broker over a persistent
//! connection; the broker pairs a caller with a callee, builds a media
//! pipeline on a media server through the [`MediaBackend`] contract,
//! relays trickle-ICE candidates in both directions and starts recording once
//! both sides have finished gathering.
//!
//! Transport and media server client live in other crates; this one is the
//! state machine.

// Error handling
pub mod errors;

// Identifiers and call state
pub mod types;

// Client wire messages
pub mod protocol;

// Media backend contract
pub mod backend;

// Configuration
pub mod config;

// Connected sessions
pub mod registry;

// Trickle ICE buffering and relay
pub mod candidates;
pub mod relay;

// Caller/callee resolution
pub mod pairing;

// RTP re-streaming through ffmpeg
pub mod restream;

// Call state machine
pub mod orchestrator;

// Public exports
pub use backend::{
    BackendError, BackendResult, ElementSpec, EndpointEvent, EndpointEventKind, EndpointEventSender,
    MediaBackend,
};
pub use candidates::{CandidateBuffer, Delivery, EndpointSink};
pub use config::{BrokerConfig, MediaTopology, RecordingConfig};
pub use errors::{BrokerError, Result};
pub use orchestrator::{ActiveCall, CallElements, CallOrchestrator, OrchestratorStats, RecordingGate, StopOutcome};
pub use protocol::{CallEndReason, CallOffer, CallParties, ClientMessage, ServerMessage};
pub use registry::{ClientHandle, Session, SessionRegistry};
pub use restream::{RestreamConfig, Restreamer};
pub use types::{CallSide, CallState, ElementId, IceCandidate, PipelineId, SessionId};

/// Re-export of common types
pub mod prelude {
    pub use super::{
        BrokerConfig, CallOrchestrator, ClientHandle, ClientMessage, MediaBackend, MediaTopology,
        ServerMessage, SessionId, StopOutcome,
    };
}
