//! Client-facing signaling messages
//!
//! Every frame is a JSON envelope `{"event": "<name>", "data": {...}}` with
//! camelCase fields inside `data`.

use crate::types::{IceCandidate, SessionId};
use serde::{Deserialize, Serialize};

/// Caller/callee pair plus the sender's SDP offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOffer {
    pub caller_id: SessionId,
    pub callee_id: SessionId,
    pub sdp: String,
}

/// Caller/callee pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParties {
    pub caller_id: SessionId,
    pub callee_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMessage {
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpAnswer {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub session_id: SessionId,
}

/// Why a call (or a ringing call attempt) ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEndReason {
    /// A participant sent `stop-call`
    Stopped,
    /// The other participant's connection went away
    PeerDisconnected,
    /// The callee never answered within the ring timeout
    NoAnswer,
    /// ICE gathering did not complete on both sides in time
    GatheringTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub caller_id: SessionId,
    pub callee_id: SessionId,
    pub reason: CallEndReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallErrorMessage {
    pub message: String,
}

/// Messages sent by browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    ClientMakeCall(CallOffer),
    ClientAcceptCall(CallOffer),
    ClientSendIceCandidate(CandidateMessage),
    StopCall(CallParties),
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Wire name of the message, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::ClientMakeCall(_) => "client-make-call",
            ClientMessage::ClientAcceptCall(_) => "client-accept-call",
            ClientMessage::ClientSendIceCandidate(_) => "client-send-ice-candidate",
            ClientMessage::StopCall(_) => "stop-call",
        }
    }
}

/// Messages pushed to browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    SessionRegistered(Registered),
    ClientHaveIncomingCall(CallParties),
    ServerSendKurentoCandidate(CandidateMessage),
    StartCommunication(SdpAnswer),
    CallEnded(CallEnded),
    CallError(CallErrorMessage),
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn incoming_call(caller_id: &SessionId, callee_id: &SessionId) -> Self {
        ServerMessage::ClientHaveIncomingCall(CallParties {
            caller_id: caller_id.clone(),
            callee_id: callee_id.clone(),
        })
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        ServerMessage::ServerSendKurentoCandidate(CandidateMessage { candidate })
    }

    pub fn start_communication(sdp: impl Into<String>) -> Self {
        ServerMessage::StartCommunication(SdpAnswer { sdp: sdp.into() })
    }

    pub fn call_ended(caller_id: &SessionId, callee_id: &SessionId, reason: CallEndReason) -> Self {
        ServerMessage::CallEnded(CallEnded {
            caller_id: caller_id.clone(),
            callee_id: callee_id.clone(),
            reason,
        })
    }

    pub fn call_error(message: impl Into<String>) -> Self {
        ServerMessage::CallError(CallErrorMessage {
            message: message.into(),
        })
    }
}
