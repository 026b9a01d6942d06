//! The local web handler that forwarded requests are passed to.

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Address of the original client, as seen by the forwarding node.
    pub remote_addr: String,
}

impl RemoteRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RemoteResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }
}

/// Serves a request forwarded from a peer. Must not touch job state.
#[async_trait]
pub trait WebHandler: Send + Sync {
    async fn handle(&self, request: RemoteRequest) -> RemoteResponse;
}

/// Default handler for nodes that serve no pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFoundHandler;

#[async_trait]
impl WebHandler for NotFoundHandler {
    async fn handle(&self, request: RemoteRequest) -> RemoteResponse {
        tracing::debug!(method = %request.method, path = %request.path, "No web handler installed");
        RemoteResponse::new(404, format!("no handler for {}", request.path))
    }
}
