//! [`MediaBackend`] over the Kurento protocol

use async_trait::async_trait;
use serde_json::{json, Value};

use rvoip_signaling_core::{
    BackendError, BackendResult, ElementId, ElementSpec, EndpointEventKind, EndpointEventSender, IceCandidate,
    MediaBackend, PipelineId,
};

use crate::client::KurentoClient;
use crate::jsonrpc::{candidate_value, event_name};

fn constructor_params(pipeline: &PipelineId, spec: &ElementSpec) -> Value {
    let mut params = json!({ "mediaPipeline": pipeline.0 });
    if let ElementSpec::RecorderEndpoint { uri, media_profile } = spec {
        params["uri"] = json!(uri);
        if let Some(profile) = media_profile {
            params["mediaProfile"] = json!(profile);
        }
    }
    params
}

#[async_trait]
impl MediaBackend for KurentoClient {
    async fn create_pipeline(&self) -> BackendResult<PipelineId> {
        let id = self.create("MediaPipeline", json!({})).await?;
        tracing::debug!(pipeline = %id, "Pipeline created");
        Ok(PipelineId(id))
    }

    async fn create_element(&self, pipeline: &PipelineId, spec: ElementSpec) -> BackendResult<ElementId> {
        let params = constructor_params(pipeline, &spec);
        let element = ElementId(self.create(spec.type_name(), params).await?);
        self.elements.insert(element.clone(), pipeline.clone());
        tracing::debug!(pipeline = %pipeline, element = %element, kind = spec.type_name(), "Element created");
        Ok(element)
    }

    async fn create_hub_port(&self, hub: &ElementId) -> BackendResult<ElementId> {
        let port = ElementId(self.create("HubPort", json!({ "hub": hub.0 })).await?);
        let pipeline = self.elements.get(hub).map(|p| p.value().clone());
        if let Some(pipeline) = pipeline {
            self.elements.insert(port.clone(), pipeline);
        }
        Ok(port)
    }

    async fn connect(&self, source: &ElementId, sink: &ElementId) -> BackendResult<()> {
        self.invoke(&source.0, "connect", json!({ "sink": sink.0 })).await?;
        Ok(())
    }

    async fn process_offer(&self, element: &ElementId, offer: &str) -> BackendResult<String> {
        let answer = self
            .invoke(&element.0, "processOffer", json!({ "offer": offer }))
            .await?;
        answer
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::protocol("processOffer", "answer is not a string"))
    }

    async fn gather_candidates(&self, element: &ElementId) -> BackendResult<()> {
        self.invoke(&element.0, "gatherCandidates", Value::Null).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, element: &ElementId, candidate: &IceCandidate) -> BackendResult<()> {
        self.invoke(
            &element.0,
            "addIceCandidate",
            json!({ "candidate": candidate_value(candidate) }),
        )
        .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        element: &ElementId,
        kind: EndpointEventKind,
        events: EndpointEventSender,
    ) -> BackendResult<()> {
        // Registered first so events racing the response are not dropped
        let key = (element.clone(), kind);
        self.subscriptions.insert(key.clone(), events);
        match self.subscribe_event(&element.0, event_name(kind)).await {
            Ok(subscription) => {
                tracing::trace!(element = %element, subscription = %subscription, "Subscribed to {}", event_name(kind));
                Ok(())
            }
            Err(e) => {
                self.subscriptions.remove(&key);
                Err(e.into())
            }
        }
    }

    async fn start_recording(&self, recorder: &ElementId) -> BackendResult<()> {
        self.invoke(&recorder.0, "record", Value::Null).await?;
        Ok(())
    }

    async fn stop_recording(&self, recorder: &ElementId) -> BackendResult<()> {
        self.invoke(&recorder.0, "stop", Value::Null).await?;
        Ok(())
    }

    async fn release(&self, pipeline: &PipelineId) -> BackendResult<()> {
        let result = self.release_object(&pipeline.0).await;

        let owned: Vec<ElementId> = self
            .elements
            .iter()
            .filter(|entry| entry.value() == pipeline)
            .map(|entry| entry.key().clone())
            .collect();
        for element in &owned {
            self.elements.remove(element);
        }
        self.subscriptions.retain(|(element, _), _| !owned.contains(element));
        tracing::debug!(pipeline = %pipeline, elements = owned.len(), "Pipeline released");

        result.map_err(BackendError::from)
    }
}
