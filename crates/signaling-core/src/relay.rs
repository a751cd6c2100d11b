//! Event Relay
//!
//! Pure forwarding between the two directions of a call:
//! - backend "new local candidate" → `server-send-kurento-candidate` to the
//!   owning side only
//! - client `client-send-ice-candidate` → the [`CandidateBuffer`]
//!
//! "Gathering finished" is consumed by the call's recording gate and is never
//! forwarded to clients.

use std::sync::Arc;

use crate::candidates::{CandidateBuffer, Delivery};
use crate::protocol::ServerMessage;
use crate::registry::SessionRegistry;
use crate::types::{IceCandidate, SessionId};

#[derive(Debug, Clone)]
pub struct EventRelay {
    registry: Arc<SessionRegistry>,
    candidates: Arc<CandidateBuffer>,
}

impl EventRelay {
    pub fn new(registry: Arc<SessionRegistry>, candidates: Arc<CandidateBuffer>) -> Self {
        Self { registry, candidates }
    }

    /// Push a candidate discovered by the backend to the browser it belongs to
    pub async fn forward_local_candidate(&self, to: &SessionId, candidate: IceCandidate) -> bool {
        let sent = self.registry.send_to(to, ServerMessage::candidate(candidate)).await;
        if !sent {
            tracing::debug!(session_id = %to, "Dropping local candidate for departed session");
        }
        sent
    }

    /// Route a candidate received from a browser towards its media endpoint
    pub fn accept_remote_candidate(&self, from: &SessionId, candidate: IceCandidate) -> Delivery {
        let delivery = self.candidates.enqueue(from, candidate);
        match &delivery {
            Delivery::Delivered(element) => {
                tracing::trace!(session_id = %from, element = %element, "Remote candidate delivered");
            }
            Delivery::Buffered { queued } => {
                tracing::trace!(session_id = %from, queued, "Remote candidate buffered");
            }
        }
        delivery
    }
}
