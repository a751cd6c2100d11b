//! Error types for the call broker

use crate::backend::BackendError;
use crate::types::{CallSide, SessionId};
use thiserror::Error;

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised by the signaling state machine
///
/// Backend failures never reach clients as-is; the orchestrator translates them
/// into one of these variants and only the rendered message is sent out.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A caller or callee id in a pairing request is not registered
    #[error("Unknown participant: {session_id}")]
    UnknownParticipant { session_id: SessionId },

    /// The transport registered the same connection twice
    #[error("Session already registered: {session_id}")]
    SessionAlreadyRegistered { session_id: SessionId },

    /// Pipeline or element creation was rejected by the media backend
    #[error("Backend provisioning failed during {step}: {source}")]
    BackendProvisioning {
        step: &'static str,
        #[source]
        source: BackendError,
    },

    /// The backend rejected a side's offer, or candidate gathering could not start
    #[error("Negotiation failed for {side}: {source}")]
    Negotiation {
        side: CallSide,
        #[source]
        source: BackendError,
    },

    /// More than one pipeline is shared by the same pair
    #[error("Internal consistency fault: {count} pipelines shared by {caller} and {callee}")]
    AmbiguousPipeline {
        caller: SessionId,
        callee: SessionId,
        count: usize,
    },

    /// The callee accepted a call the caller never offered (or that already timed out)
    #[error("No pending offer from {caller} to {callee}")]
    NoPendingOffer { caller: SessionId, callee: SessionId },

    /// One of the participants already has a media endpoint in another call
    #[error("Participant {session_id} is already in a call")]
    ParticipantBusy { session_id: SessionId },

    /// A session tried to call itself
    #[error("Session {session_id} cannot call itself")]
    SelfCall { session_id: SessionId },
}

impl BrokerError {
    pub fn unknown_participant(session_id: &SessionId) -> Self {
        Self::UnknownParticipant {
            session_id: session_id.clone(),
        }
    }

    pub fn provisioning(step: &'static str, source: BackendError) -> Self {
        Self::BackendProvisioning { step, source }
    }

    pub fn negotiation(side: CallSide, source: BackendError) -> Self {
        Self::Negotiation { side, source }
    }

    /// Whether the error is the silently-dropped kind (no client is told)
    pub fn is_silent(&self) -> bool {
        matches!(self, BrokerError::UnknownParticipant { .. })
    }
}
