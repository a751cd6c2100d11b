//! Kurento JSON-RPC 2.0 wire format
//!
//! Requests carry one of the Kurento methods (`create`, `invoke`,
//! `subscribe`, `release`, `ping`) and, once the server has assigned one, the
//! session id. The server answers with `{"result": {"value": ..., "sessionId": ...}}`
//! or an `error` object, and pushes `onEvent` notifications for subscribed
//! element events.

use rvoip_signaling_core::{EndpointEventKind, IceCandidate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// `error` member of a failed response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Anything the media server sends us
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

#[derive(Deserialize)]
struct RawIncoming {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<RpcError>,
}

impl Incoming {
    pub fn parse(text: &str) -> Result<Self, String> {
        let raw: RawIncoming = serde_json::from_str(text).map_err(|e| e.to_string())?;

        if let Some(method) = raw.method {
            return Ok(Incoming::Notification {
                method,
                params: raw.params,
            });
        }

        let id = raw
            .id
            .and_then(|id| id.as_u64())
            .ok_or_else(|| "response without a numeric id".to_string())?;
        let outcome = match (raw.error, raw.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        };
        Ok(Incoming::Response { id, outcome })
    }
}

fn with_session(mut params: Map<String, Value>, session_id: Option<&str>) -> Value {
    if let Some(session_id) = session_id {
        params.insert("sessionId".to_string(), Value::String(session_id.to_string()));
    }
    Value::Object(params)
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn create_params(kind: &str, constructor_params: Value, session_id: Option<&str>) -> Value {
    with_session(
        object(json!({
            "type": kind,
            "constructorParams": constructor_params,
            "properties": {},
        })),
        session_id,
    )
}

pub fn invoke_params(target: &str, operation: &str, operation_params: Value, session_id: Option<&str>) -> Value {
    let mut params = object(json!({
        "object": target,
        "operation": operation,
    }));
    if !operation_params.is_null() {
        params.insert("operationParams".to_string(), operation_params);
    }
    with_session(params, session_id)
}

pub fn subscribe_params(target: &str, event: &str, session_id: Option<&str>) -> Value {
    with_session(object(json!({ "type": event, "object": target })), session_id)
}

pub fn release_params(target: &str, session_id: Option<&str>) -> Value {
    with_session(object(json!({ "object": target })), session_id)
}

pub fn ping_params(interval_ms: u64) -> Value {
    json!({ "interval": interval_ms })
}

/// Kurento `IceCandidate` complex type
pub fn candidate_value(candidate: &IceCandidate) -> Value {
    json!({
        "__module__": "kurento",
        "__type__": "IceCandidate",
        "candidate": candidate.candidate,
        "sdpMid": candidate.sdp_mid.clone().unwrap_or_default(),
        "sdpMLineIndex": candidate.sdp_m_line_index.unwrap_or(0),
    })
}

/// Event name used when subscribing to `kind`
pub fn event_name(kind: EndpointEventKind) -> &'static str {
    match kind {
        EndpointEventKind::NewLocalCandidate => "IceCandidateFound",
        EndpointEventKind::GatheringFinished => "IceGatheringDone",
    }
}

/// Map an `onEvent` type to the kind it reports, accepting legacy names
pub fn event_kind(name: &str) -> Option<EndpointEventKind> {
    match name {
        "IceCandidateFound" | "OnIceCandidate" => Some(EndpointEventKind::NewLocalCandidate),
        "IceGatheringDone" | "OnIceGatheringDone" => Some(EndpointEventKind::GatheringFinished),
        _ => None,
    }
}

/// An element event pushed through `onEvent`
#[derive(Debug, Clone, PartialEq)]
pub struct ElementEvent {
    pub kind: EndpointEventKind,
    /// Element that raised the event
    pub object: String,
    pub candidate: Option<IceCandidate>,
}

/// Decode the params of an `onEvent` notification
///
/// Returns `None` for event types the broker never subscribes to.
pub fn parse_event(params: &Value) -> Option<ElementEvent> {
    let value = params.get("value")?;
    let name = value
        .get("type")
        .or_else(|| value.pointer("/data/type"))
        .and_then(Value::as_str)?;
    let kind = event_kind(name)?;

    let object = value
        .get("object")
        .or_else(|| value.pointer("/data/source"))
        .and_then(Value::as_str)?
        .to_string();

    let candidate = match kind {
        EndpointEventKind::NewLocalCandidate => {
            let raw = value.pointer("/data/candidate")?.clone();
            Some(serde_json::from_value::<IceCandidate>(raw).ok()?)
        }
        EndpointEventKind::GatheringFinished => None,
    };

    Some(ElementEvent { kind, object, candidate })
}
