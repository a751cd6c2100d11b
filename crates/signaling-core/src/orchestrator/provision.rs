//! Accepting a call: pipeline provisioning and negotiation

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{ActiveCall, CallElements, CallOrchestrator};
use crate::backend::{BackendError, ElementSpec, EndpointEvent, EndpointEventKind, EndpointEventSender};
use crate::candidates::{spawn_forwarder, EndpointSink};
use crate::config::MediaTopology;
use crate::errors::{BrokerError, Result};
use crate::pairing::resolve_pair;
use crate::protocol::{CallEndReason, CallOffer, ServerMessage};
use crate::types::{CallSide, CallState, ElementId, PipelineId, SessionId};

fn at(step: &'static str) -> impl FnOnce(BackendError) -> BrokerError {
    move |e| BrokerError::provisioning(step, e)
}

impl CallOrchestrator {
    /// Callee accepts a ringing call
    ///
    /// Builds the pipeline, binds candidate routing for both sides, runs both
    /// SDP negotiations concurrently and hands each side its own answer.
    /// Returns the pipeline now serving the call.
    pub async fn accept_call(&self, offer: CallOffer) -> Result<PipelineId> {
        let CallOffer {
            caller_id,
            callee_id,
            sdp: callee_sdp,
        } = offer;
        let (caller, _) = resolve_pair(&self.registry, &caller_id, &callee_id).await?;

        let no_offer = || BrokerError::NoPendingOffer {
            caller: caller_id.clone(),
            callee: callee_id.clone(),
        };
        let Some(pending) = self.take_pending(&caller_id, &callee_id) else {
            return self.reject(&callee_id, no_offer()).await;
        };
        let Some(caller_sdp) = caller.sdp.clone() else {
            return self.reject(&callee_id, no_offer()).await;
        };
        if let Err(session_id) = self.engage(&caller_id, &callee_id) {
            return self.reject(&callee_id, BrokerError::ParticipantBusy { session_id }).await;
        }

        if let Err(e) = self.registry.set_offer(&callee_id, callee_sdp.clone()).await {
            self.disengage(&caller_id, &callee_id);
            return Err(e);
        }
        tracing::info!(
            caller = %caller_id,
            callee = %callee_id,
            rang_for_ms = pending.offered_at.elapsed().as_millis() as u64,
            "Call accepted"
        );

        let pipeline = match self.backend.create_pipeline().await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                return self
                    .fail_provisioning(&caller_id, &callee_id, None, BrokerError::provisioning("create pipeline", e))
                    .await;
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let elements = match self.build_media(&pipeline, &caller_id, &callee_id, &events_tx).await {
            Ok(elements) => elements,
            Err(e) => return self.fail_provisioning(&caller_id, &callee_id, Some(&pipeline), e).await,
        };
        drop(events_tx);

        let call = Arc::new(ActiveCall::new(caller_id.clone(), callee_id.clone(), pipeline.clone(), elements));
        self.calls.insert(pipeline.clone(), call.clone());
        self.start_event_loop(&call, events_rx);

        for side in [CallSide::Caller, CallSide::Callee] {
            let id = call.session(side);
            if let Err(e) = self
                .registry
                .attach_call(id, &pipeline, call.elements.endpoint(side))
                .await
            {
                tracing::warn!(session_id = %id, "Participant left during provisioning");
                let peer = call.session(side.other());
                self.teardown(&pipeline, CallState::Failed, CallEndReason::PeerDisconnected, &[peer])
                    .await;
                return Err(e);
            }
        }

        for side in [CallSide::Caller, CallSide::Callee] {
            let endpoint = call.elements.endpoint(side).clone();
            let (sink, rx) = EndpointSink::channel(endpoint.clone());
            spawn_forwarder(self.backend.clone(), endpoint, rx);
            let drained = self.candidates.drain_to(call.session(side), sink);
            tracing::debug!(session_id = %call.session(side), drained, "Candidate routing bound");
        }

        call.advance(CallState::Negotiating);
        let (caller_result, callee_result) = tokio::join!(
            self.negotiate(&call.elements.caller_endpoint, &caller_sdp),
            self.negotiate(&call.elements.callee_endpoint, &callee_sdp),
        );

        let mut answers = Vec::with_capacity(2);
        let mut failure = None;
        for (side, result) in [(CallSide::Caller, caller_result), (CallSide::Callee, callee_result)] {
            match result {
                Ok(answer) => answers.push((side, answer)),
                Err(e) => {
                    let error = BrokerError::negotiation(side, e);
                    tracing::warn!(pipeline = %pipeline, "{}", error);
                    self.notify_error(call.session(side), &error).await;
                    failure.get_or_insert(error);
                }
            }
        }
        if let Some(error) = failure {
            self.teardown(&pipeline, CallState::Failed, CallEndReason::Stopped, &[])
                .await;
            return Err(error);
        }

        if !self.calls.contains_key(&pipeline) {
            tracing::debug!(pipeline = %pipeline, "Call ended while negotiating");
            return Ok(pipeline);
        }
        call.advance(CallState::GatheringCandidates);
        for (side, answer) in answers {
            self.registry
                .send_to(call.session(side), ServerMessage::start_communication(answer))
                .await;
        }
        call.advance(CallState::Active);
        tracing::info!(pipeline = %pipeline, caller = %caller_id, callee = %callee_id, "Call established");

        self.start_restream(&call).await;
        Ok(pipeline)
    }

    /// Create, wire and subscribe the elements of a new call
    async fn build_media(
        &self,
        pipeline: &PipelineId,
        caller: &SessionId,
        callee: &SessionId,
        events: &EndpointEventSender,
    ) -> Result<CallElements> {
        let backend = &self.backend;

        let caller_endpoint = backend
            .create_element(pipeline, ElementSpec::WebRtcEndpoint)
            .await
            .map_err(at("caller endpoint"))?;
        let callee_endpoint = backend
            .create_element(pipeline, ElementSpec::WebRtcEndpoint)
            .await
            .map_err(at("callee endpoint"))?;
        let recorder = backend
            .create_element(
                pipeline,
                ElementSpec::RecorderEndpoint {
                    uri: self.config.recording.uri_for(caller, callee),
                    media_profile: self.config.recording.media_profile.clone(),
                },
            )
            .await
            .map_err(at("recorder"))?;
        let rtp = match self.restreamer {
            Some(_) => Some(
                backend
                    .create_element(pipeline, ElementSpec::RtpEndpoint)
                    .await
                    .map_err(at("rtp endpoint"))?,
            ),
            None => None,
        };

        backend
            .connect(&callee_endpoint, &caller_endpoint)
            .await
            .map_err(at("connect endpoints"))?;
        backend
            .connect(&caller_endpoint, &callee_endpoint)
            .await
            .map_err(at("connect endpoints"))?;

        let hub = match self.config.topology {
            MediaTopology::Direct => {
                backend
                    .connect(&caller_endpoint, &recorder)
                    .await
                    .map_err(at("connect recorder"))?;
                if let Some(rtp) = &rtp {
                    backend.connect(&caller_endpoint, rtp).await.map_err(at("connect rtp"))?;
                }
                None
            }
            MediaTopology::Composite => {
                let hub = backend
                    .create_element(pipeline, ElementSpec::Composite)
                    .await
                    .map_err(at("composite hub"))?;
                for endpoint in [&caller_endpoint, &callee_endpoint] {
                    let port = backend.create_hub_port(&hub).await.map_err(at("hub port"))?;
                    backend.connect(endpoint, &port).await.map_err(at("connect hub"))?;
                }
                let recorder_port = backend.create_hub_port(&hub).await.map_err(at("hub port"))?;
                backend
                    .connect(&recorder_port, &recorder)
                    .await
                    .map_err(at("connect recorder"))?;
                if let Some(rtp) = &rtp {
                    let rtp_port = backend.create_hub_port(&hub).await.map_err(at("hub port"))?;
                    backend.connect(&rtp_port, rtp).await.map_err(at("connect rtp"))?;
                }
                Some(hub)
            }
        };

        for endpoint in [&caller_endpoint, &callee_endpoint] {
            for kind in [EndpointEventKind::NewLocalCandidate, EndpointEventKind::GatheringFinished] {
                backend
                    .subscribe(endpoint, kind, events.clone())
                    .await
                    .map_err(at("subscribe"))?;
            }
        }

        Ok(CallElements {
            caller_endpoint,
            callee_endpoint,
            recorder,
            hub,
            rtp,
        })
    }

    fn start_event_loop(&self, call: &Arc<ActiveCall>, events: mpsc::UnboundedReceiver<EndpointEvent>) {
        let weak = self.weak_self.clone();
        let pipeline = call.pipeline.clone();
        let (caller, callee) = (call.caller.clone(), call.callee.clone());
        let on_timeout = move || {
            let Some(this) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                this.teardown(
                    &pipeline,
                    CallState::Failed,
                    CallEndReason::GatheringTimeout,
                    &[&caller, &callee],
                )
                .await;
            });
        };
        call.spawn_event_loop(
            events,
            self.relay.clone(),
            self.backend.clone(),
            self.config.gathering_timeout(),
            on_timeout,
        );
    }

    /// Process one side's offer and start its candidate gathering
    async fn negotiate(&self, endpoint: &ElementId, offer: &str) -> std::result::Result<String, BackendError> {
        let answer = self.backend.process_offer(endpoint, offer).await?;
        self.backend.gather_candidates(endpoint).await?;
        Ok(answer)
    }

    async fn start_restream(&self, call: &ActiveCall) {
        let (Some(restreamer), Some(rtp)) = (&self.restreamer, &call.elements.rtp) else {
            return;
        };
        match restreamer.start(self.backend.as_ref(), rtp).await {
            Ok(process) => {
                if let Some(orphan) = call.set_restream(process) {
                    orphan.stop().await;
                }
            }
            Err(e) => {
                tracing::warn!(pipeline = %call.pipeline, "Re-streaming unavailable: {}", e);
            }
        }
    }

    async fn fail_provisioning<T>(
        &self,
        caller: &SessionId,
        callee: &SessionId,
        pipeline: Option<&PipelineId>,
        error: BrokerError,
    ) -> Result<T> {
        tracing::error!(caller = %caller, callee = %callee, "{}", error);
        self.disengage(caller, callee);
        if let Some(pipeline) = pipeline {
            if let Err(e) = self.backend.release(pipeline).await {
                tracing::warn!(pipeline = %pipeline, "Failed to release pipeline: {}", e);
            }
        }
        for id in [caller, callee] {
            self.notify_error(id, &error).await;
        }
        Err(error)
    }

    async fn reject<T>(&self, to: &SessionId, error: BrokerError) -> Result<T> {
        self.notify_error(to, &error).await;
        Err(error)
    }
}
