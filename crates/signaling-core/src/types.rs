//! Core identifiers and value types shared by every broker component

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one connected client, stable for the connection's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a fresh random session id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backend handle of a media pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(pub String);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend handle of a media element (endpoint, recorder, hub, hub port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub String);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trickle-ICE connectivity candidate, carried opaquely between client and backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Which participant of a call something belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallSide {
    Caller,
    Callee,
}

impl CallSide {
    pub fn other(self) -> Self {
        match self {
            CallSide::Caller => CallSide::Callee,
            CallSide::Callee => CallSide::Caller,
        }
    }
}

impl fmt::Display for CallSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallSide::Caller => write!(f, "caller"),
            CallSide::Callee => write!(f, "callee"),
        }
    }
}

/// States of one call attempt
///
/// States only move forward; `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    OfferReceived,
    Ringing,
    Accepted,
    Provisioning,
    Negotiating,
    GatheringCandidates,
    Active,
    Recording,
    Stopped,
    Failed,
}

impl CallState {
    fn rank(self) -> u8 {
        match self {
            CallState::Idle => 0,
            CallState::OfferReceived => 1,
            CallState::Ringing => 2,
            CallState::Accepted => 3,
            CallState::Provisioning => 4,
            CallState::Negotiating => 5,
            CallState::GatheringCandidates => 6,
            CallState::Active => 7,
            CallState::Recording => 8,
            CallState::Stopped | CallState::Failed => 9,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Stopped | CallState::Failed)
    }

    /// Whether moving from `self` to `next` is a forward transition
    pub fn can_advance_to(self, next: CallState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
