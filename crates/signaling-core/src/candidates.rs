//! Candidate Buffer
//!
//! Trickle-ICE candidates from a browser can arrive before the media endpoint
//! that consumes them exists. Until a session is bound to an endpoint its
//! candidates are queued; binding drains the queue into the endpoint and every
//! later candidate goes straight through.
//!
//! Binding and draining happen under the same lock acquisition as the
//! immediate-or-buffer decision, and delivery is an ordered channel consumed
//! by one forwarder task per endpoint. Together this gives per-session FIFO,
//! exactly-once delivery regardless of how enqueues race with the bind.
//!
//! Queues are bounded; once full, the oldest candidate is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::MediaBackend;
use crate::types::{ElementId, IceCandidate, SessionId};

/// Ordered delivery route into one media endpoint
#[derive(Debug, Clone)]
pub struct EndpointSink {
    element: ElementId,
    tx: mpsc::UnboundedSender<IceCandidate>,
}

impl EndpointSink {
    pub fn new(element: ElementId, tx: mpsc::UnboundedSender<IceCandidate>) -> Self {
        Self { element, tx }
    }

    /// Create a sink and the receiver its forwarder consumes
    pub fn channel(element: ElementId) -> (Self, mpsc::UnboundedReceiver<IceCandidate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(element, tx), rx)
    }

    pub fn element(&self) -> &ElementId {
        &self.element
    }

    fn deliver(&self, candidate: IceCandidate) -> Result<(), IceCandidate> {
        self.tx.send(candidate).map_err(|e| e.0)
    }
}

/// Outcome of [`CandidateBuffer::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the bound endpoint
    Delivered(ElementId),
    /// Queued until an endpoint is bound; `queued` is the queue length after the push
    Buffered { queued: usize },
}

#[derive(Debug)]
enum Entry {
    Pending(VecDeque<IceCandidate>),
    Bound(EndpointSink),
}

/// Queue bound used by [`CandidateBuffer::new`]
pub const DEFAULT_PENDING_LIMIT: usize = 64;

/// Per-session queue of candidates waiting for a media endpoint
#[derive(Debug)]
pub struct CandidateBuffer {
    entries: Mutex<HashMap<SessionId, Entry>>,
    limit: usize,
}

impl Default for CandidateBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_PENDING_LIMIT)
    }
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer keeping at most `limit` candidates per unbound session
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    /// Deliver `candidate` to the session's endpoint, or queue it if none is bound
    pub fn enqueue(&self, session_id: &SessionId, candidate: IceCandidate) -> Delivery {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(session_id.clone())
            .or_insert_with(|| Entry::Pending(VecDeque::new()));

        let candidate = match &mut *entry {
            Entry::Bound(sink) => match sink.deliver(candidate) {
                Ok(()) => return Delivery::Delivered(sink.element().clone()),
                Err(candidate) => {
                    // Forwarder is gone: the endpoint is being torn down
                    tracing::debug!(session_id = %session_id, element = %sink.element(), "Endpoint sink closed, buffering candidate");
                    candidate
                }
            },
            Entry::Pending(queue) => {
                if queue.len() >= self.limit {
                    queue.pop_front();
                    tracing::warn!(session_id = %session_id, limit = self.limit, "Candidate queue full, dropped oldest");
                }
                queue.push_back(candidate);
                return Delivery::Buffered { queued: queue.len() };
            }
        };

        let mut queue = VecDeque::new();
        queue.push_back(candidate);
        *entry = Entry::Pending(queue);
        Delivery::Buffered { queued: 1 }
    }

    /// Bind `sink` to the session and hand it every queued candidate, oldest first
    ///
    /// Returns the number of candidates drained. Calling this with nothing
    /// queued just binds the sink.
    pub fn drain_to(&self, session_id: &SessionId, sink: EndpointSink) -> usize {
        let mut entries = self.entries.lock();
        let mut queue = match entries.remove(session_id) {
            Some(Entry::Pending(queue)) => queue,
            Some(Entry::Bound(previous)) => {
                tracing::warn!(
                    session_id = %session_id,
                    previous = %previous.element(),
                    next = %sink.element(),
                    "Rebinding candidate sink"
                );
                VecDeque::new()
            }
            None => VecDeque::new(),
        };

        let mut drained = 0;
        while let Some(candidate) = queue.pop_front() {
            if let Err(candidate) = sink.deliver(candidate) {
                queue.push_front(candidate);
                tracing::warn!(session_id = %session_id, element = %sink.element(), "Sink closed while draining candidates");
                entries.insert(session_id.clone(), Entry::Pending(queue));
                return drained;
            }
            drained += 1;
        }

        tracing::debug!(session_id = %session_id, element = %sink.element(), drained, "Bound candidate sink");
        entries.insert(session_id.clone(), Entry::Bound(sink));
        drained
    }

    /// Drop whatever is queued for a session; a bound sink is left alone
    ///
    /// Returns the number of candidates discarded.
    pub fn clear_pending(&self, session_id: &SessionId) -> usize {
        let mut entries = self.entries.lock();
        match entries.get(session_id) {
            Some(Entry::Pending(queue)) => {
                let discarded = queue.len();
                entries.remove(session_id);
                discarded
            }
            _ => 0,
        }
    }

    /// Forget everything about a session, bound sink included
    pub fn remove(&self, session_id: &SessionId) {
        self.entries.lock().remove(session_id);
    }

    /// Number of candidates currently queued for a session
    pub fn pending_len(&self, session_id: &SessionId) -> usize {
        match self.entries.lock().get(session_id) {
            Some(Entry::Pending(queue)) => queue.len(),
            _ => 0,
        }
    }

    pub fn is_bound(&self, session_id: &SessionId) -> bool {
        matches!(self.entries.lock().get(session_id), Some(Entry::Bound(_)))
    }
}

/// Spawn the task that feeds a sink's candidates to the backend, one at a time
///
/// The task ends once every clone of the sink has been dropped.
pub fn spawn_forwarder(
    backend: Arc<dyn MediaBackend>,
    element: ElementId,
    mut rx: mpsc::UnboundedReceiver<IceCandidate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(candidate) = rx.recv().await {
            if let Err(e) = backend.add_ice_candidate(&element, &candidate).await {
                tracing::warn!(element = %element, "Failed to add remote candidate: {}", e);
            }
        }
        tracing::trace!(element = %element, "Candidate forwarder finished");
    })
}
