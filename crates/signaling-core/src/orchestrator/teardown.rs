//! Ending calls: stop requests, disconnects, timeouts and shutdown
//!
//! Removing a call from the active-call map is the only thing that
//! authorizes releasing its pipeline, so racing stop paths release once.

use super::{CallOrchestrator, PairKey, StopOutcome};
use crate::errors::{BrokerError, Result};
use crate::pairing::{common_pipelines, resolve_pair, shared_pipeline};
use crate::protocol::CallEndReason;
use crate::types::{CallState, PipelineId, SessionId};

impl CallOrchestrator {
    /// Stop the call between `caller_id` and `callee_id` on behalf of `requester`
    ///
    /// Participants other than the requester receive `call-ended`. A pair
    /// with no call is left untouched.
    pub async fn stop_call(
        &self,
        requester: &SessionId,
        caller_id: &SessionId,
        callee_id: &SessionId,
    ) -> Result<StopOutcome> {
        let (caller, callee) = resolve_pair(&self.registry, caller_id, callee_id).await?;

        match shared_pipeline(&caller, &callee) {
            Ok(None) => {
                tracing::debug!(caller = %caller_id, callee = %callee_id, "No call to stop");
                Ok(StopOutcome::NoActiveCall)
            }
            Ok(Some(pipeline)) => {
                let notify: Vec<&SessionId> = [caller_id, callee_id]
                    .into_iter()
                    .filter(|id| *id != requester)
                    .collect();
                if self
                    .teardown(&pipeline, CallState::Stopped, CallEndReason::Stopped, &notify)
                    .await
                {
                    Ok(StopOutcome::Released(pipeline))
                } else {
                    Ok(StopOutcome::NoActiveCall)
                }
            }
            Err(error @ BrokerError::AmbiguousPipeline { .. }) => {
                tracing::error!(caller = %caller_id, callee = %callee_id, "{}", error);
                for pipeline in common_pipelines(&caller, &callee) {
                    if !self
                        .teardown(&pipeline, CallState::Failed, CallEndReason::Stopped, &[])
                        .await
                    {
                        self.release_untracked(&pipeline, &[caller_id, callee_id]).await;
                    }
                }
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// The transport lost `id`'s connection
    ///
    /// Ends every call the session takes part in (the peer is told
    /// `peer-disconnected`), cancels ringing calls involving it, then forgets
    /// the session and its buffered candidates.
    pub async fn disconnect(&self, id: &SessionId) {
        let ringing: Vec<PairKey> = self
            .pending
            .iter()
            .filter(|entry| &entry.key().0 == id || &entry.key().1 == id)
            .map(|entry| entry.key().clone())
            .collect();
        for (caller, callee) in ringing {
            if self.take_pending(&caller, &callee).is_some() {
                let other = if &caller == id { &callee } else { &caller };
                self.notify_ended(&[other], &caller, &callee, CallEndReason::PeerDisconnected)
                    .await;
                tracing::debug!(caller = %caller, callee = %callee, "Ringing call cancelled");
            }
        }

        let Some(session) = self.registry.remove(id).await else {
            self.candidates.remove(id);
            tracing::debug!(session_id = %id, "Disconnect for unknown session");
            return;
        };

        for pipeline in &session.pipelines {
            let Some(call) = self.call(pipeline) else {
                tracing::debug!(pipeline = %pipeline, "Call already ending");
                continue;
            };
            let notify: Vec<&SessionId> = call.peer_of(id).into_iter().collect();
            self.teardown(pipeline, CallState::Stopped, CallEndReason::PeerDisconnected, &notify)
                .await;
        }

        self.candidates.remove(id);
        tracing::info!(session_id = %id, calls = session.pipelines.len(), "Client disconnected");
    }

    /// Tear down every call and forget every ringing one
    pub async fn shutdown(&self) {
        let ringing: Vec<PairKey> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for (caller, callee) in ringing {
            self.take_pending(&caller, &callee);
        }

        for pipeline in self.active_calls() {
            let Some(call) = self.call(&pipeline) else {
                continue;
            };
            self.teardown(
                &pipeline,
                CallState::Stopped,
                CallEndReason::Stopped,
                &[&call.caller, &call.callee],
            )
            .await;
        }
        tracing::info!("Call orchestrator shut down");
    }

    /// Ring timer fired: cancel the call unless it was answered meanwhile
    pub(super) async fn expire_ringing(&self, caller: &SessionId, callee: &SessionId) {
        // Runs on the timer task itself, so the handle is dropped rather than aborted.
        let Some((_, pending)) = self.pending.remove(&(caller.clone(), callee.clone())) else {
            return;
        };
        tracing::info!(
            caller = %caller,
            callee = %callee,
            rang_for_ms = pending.offered_at.elapsed().as_millis() as u64,
            "Call not answered"
        );
        self.notify_ended(&[caller, callee], caller, callee, CallEndReason::NoAnswer)
            .await;
    }

    /// End a call and release its pipeline
    ///
    /// Returns false if the call was already gone, in which case nothing is
    /// touched.
    pub(super) async fn teardown(
        &self,
        pipeline: &PipelineId,
        final_state: CallState,
        reason: CallEndReason,
        notify: &[&SessionId],
    ) -> bool {
        let Some((_, call)) = self.calls.remove(pipeline) else {
            tracing::trace!(pipeline = %pipeline, "Teardown already done");
            return false;
        };

        call.advance(final_state);
        if let Some(task) = call.take_event_task() {
            task.abort();
        }

        if call.is_recording() {
            if let Err(e) = self.backend.stop_recording(&call.elements.recorder).await {
                tracing::warn!(pipeline = %pipeline, "Failed to stop recording: {}", e);
            }
        }
        if let Some(process) = call.take_restream() {
            process.stop().await;
        }
        if let Err(e) = self.backend.release(pipeline).await {
            tracing::warn!(pipeline = %pipeline, "Failed to release pipeline: {}", e);
        }

        for id in [&call.caller, &call.callee] {
            self.registry.detach_pipeline(id, pipeline).await;
            self.candidates.remove(id);
        }
        self.disengage(&call.caller, &call.callee);
        self.notify_ended(notify, &call.caller, &call.callee, reason).await;

        tracing::info!(
            pipeline = %pipeline,
            caller = %call.caller,
            callee = %call.callee,
            state = %call.state(),
            reason = ?reason,
            duration_ms = call.started_at.elapsed().as_millis() as u64,
            "Call ended"
        );
        true
    }

    /// Release a pipeline sessions still point at but no call owns
    async fn release_untracked(&self, pipeline: &PipelineId, sessions: &[&SessionId]) {
        if let Err(e) = self.backend.release(pipeline).await {
            tracing::warn!(pipeline = %pipeline, "Failed to release pipeline: {}", e);
        }
        for id in sessions {
            self.registry.detach_pipeline(id, pipeline).await;
            self.candidates.remove(id);
        }
    }
}
