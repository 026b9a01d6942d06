//! Conversions between wire messages and domain types.

use tonic::Status;
use uuid::Uuid;

use crate::hooks::{EventKind, GlobalEvent};
use crate::proto;
use crate::web::{RemoteRequest, RemoteResponse};

fn headers_to_proto(headers: Vec<(String, String)>) -> Vec<proto::Header> {
    headers
        .into_iter()
        .map(|(name, value)| proto::Header { name, value })
        .collect()
}

fn headers_from_proto(headers: Vec<proto::Header>) -> Vec<(String, String)> {
    headers.into_iter().map(|h| (h.name, h.value)).collect()
}

impl From<RemoteRequest> for proto::WebRequest {
    fn from(req: RemoteRequest) -> Self {
        proto::WebRequest {
            method: req.method,
            path: req.path,
            headers: headers_to_proto(req.headers),
            body: req.body,
            remote_addr: req.remote_addr,
        }
    }
}

impl From<proto::WebRequest> for RemoteRequest {
    fn from(req: proto::WebRequest) -> Self {
        RemoteRequest {
            method: req.method,
            path: req.path,
            headers: headers_from_proto(req.headers),
            body: req.body,
            remote_addr: req.remote_addr,
        }
    }
}

impl From<RemoteResponse> for proto::WebResponse {
    fn from(resp: RemoteResponse) -> Self {
        proto::WebResponse {
            status: u32::from(resp.status),
            headers: headers_to_proto(resp.headers),
            body: resp.body,
        }
    }
}

impl TryFrom<proto::WebResponse> for RemoteResponse {
    type Error = Status;

    fn try_from(resp: proto::WebResponse) -> Result<Self, Self::Error> {
        let status = u16::try_from(resp.status)
            .map_err(|_| Status::data_loss(format!("invalid HTTP status {}", resp.status)))?;
        Ok(RemoteResponse {
            status,
            headers: headers_from_proto(resp.headers),
            body: resp.body,
        })
    }
}

pub fn kind_to_proto(kind: EventKind) -> proto::EventKind {
    match kind {
        EventKind::WorkWake => proto::EventKind::WorkWake,
        EventKind::PluginUnloaded => proto::EventKind::PluginUnloaded,
        EventKind::NodeRestarting => proto::EventKind::NodeRestarting,
        EventKind::CacheInvalidate => proto::EventKind::CacheInvalidate,
    }
}

pub fn kind_from_proto(kind: i32) -> Result<EventKind, Status> {
    match proto::EventKind::try_from(kind) {
        Ok(proto::EventKind::WorkWake) => Ok(EventKind::WorkWake),
        Ok(proto::EventKind::PluginUnloaded) => Ok(EventKind::PluginUnloaded),
        Ok(proto::EventKind::NodeRestarting) => Ok(EventKind::NodeRestarting),
        Ok(proto::EventKind::CacheInvalidate) => Ok(EventKind::CacheInvalidate),
        Ok(proto::EventKind::Unspecified) | Err(_) => {
            Err(Status::invalid_argument(format!("unknown event kind {}", kind)))
        }
    }
}

pub fn encode_event(event: &GlobalEvent, origin: Uuid) -> Result<proto::GlobalHookRequest, Status> {
    let payload = serde_json::to_vec(event)
        .map_err(|e| Status::internal(format!("cannot encode event: {}", e)))?;
    Ok(proto::GlobalHookRequest {
        kind: kind_to_proto(event.kind()) as i32,
        payload,
        origin_node: origin.to_string(),
    })
}

/// Decode an event, rejecting payloads that disagree with the declared kind.
pub fn decode_event(req: &proto::GlobalHookRequest) -> Result<GlobalEvent, Status> {
    let kind = kind_from_proto(req.kind)?;
    let event: GlobalEvent = serde_json::from_slice(&req.payload)
        .map_err(|e| Status::invalid_argument(format!("malformed event payload: {}", e)))?;
    if event.kind() != kind {
        return Err(Status::invalid_argument(format!(
            "payload is {} but kind says {:?}",
            event.name(),
            kind
        )));
    }
    Ok(event)
}

pub fn parse_plugin_id(raw: &str) -> Result<Uuid, Status> {
    if raw.is_empty() {
        return Ok(Uuid::nil());
    }
    Uuid::parse_str(raw).map_err(|_| Status::invalid_argument("Invalid plugin ID"))
}
