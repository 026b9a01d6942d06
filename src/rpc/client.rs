use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use uuid::Uuid;

use crate::error::{NodeError, Result};
use crate::hooks::GlobalEvent;
use crate::proto::node_control_client::NodeControlClient;
use crate::proto::{LifecycleRequest, UnloadPluginRequest};
use crate::registry::{NodeRecord, NodeRegistry};
use crate::rpc::convert::encode_event;
use crate::tls::TlsIdentity;
use crate::web::{RemoteRequest, RemoteResponse};

/// A resolved control-plane endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub uuid: Uuid,
    pub host: String,
    pub port: u16,
}

impl Peer {
    pub fn from_record(record: &NodeRecord) -> Option<Self> {
        record.rpc_endpoint().map(|(host, port)| Peer {
            uuid: record.uuid,
            host: host.to_string(),
            port,
        })
    }

    /// A peer addressed directly by `host:port`, outside the registry.
    pub fn direct(addr: &str) -> Result<Self> {
        let addr = addr
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| NodeError::Config(format!("expected host:port, got '{}'", addr)))?;
        let port = port
            .parse()
            .map_err(|_| NodeError::Config(format!("invalid port in '{}'", addr)))?;
        Ok(Peer {
            uuid: Uuid::nil(),
            host: host.to_string(),
            port,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.uuid.is_nil() {
            write!(f, "{}", self.addr())
        } else {
            write!(f, "{}@{}", self.uuid, self.addr())
        }
    }
}

/// Answer to a remote restart or shutdown request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleAck {
    pub accepted: bool,
    /// Peer state when the request was evaluated.
    pub state: String,
}

/// Control-plane client.
///
/// Every call dials a fresh channel and is bounded by `timeout` end to end.
/// Failures come back as `RpcUnreachable` or `RemoteFailure` and are never
/// retried here.
#[derive(Debug, Clone)]
pub struct PeerClient {
    tls_identity: Option<TlsIdentity>,
    timeout: Duration,
    origin: Uuid,
}

impl PeerClient {
    pub fn new(origin: Uuid, timeout: Duration, tls_identity: Option<TlsIdentity>) -> Self {
        Self {
            tls_identity,
            timeout,
            origin,
        }
    }

    /// Look a node up in the registry and return its endpoint.
    pub async fn resolve(registry: &NodeRegistry, uuid: Uuid) -> Result<Peer> {
        let record = registry.get(uuid).await?.ok_or_else(|| NodeError::RpcUnreachable {
            peer: uuid.to_string(),
            reason: "node is not registered".to_string(),
        })?;
        Peer::from_record(&record).ok_or_else(|| NodeError::RpcUnreachable {
            peer: uuid.to_string(),
            reason: "node does not export RPC".to_string(),
        })
    }

    async fn connect(&self, peer: &Peer) -> Result<NodeControlClient<Channel>> {
        let scheme = if self.tls_identity.is_some() { "https" } else { "http" };
        let uri = format!("{}://{}", scheme, peer.addr());
        let unreachable = |reason: String| NodeError::RpcUnreachable {
            peer: peer.to_string(),
            reason,
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| unreachable(format!("invalid endpoint: {}", e)))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);
        if let Some(ref identity) = self.tls_identity {
            endpoint = endpoint
                .tls_config(identity.client_tls_config())
                .map_err(|e| NodeError::Config(format!("TLS config error: {}", e)))?;
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| unreachable(format!("connect failed: {}", e)))?;
        Ok(NodeControlClient::new(channel))
    }

    async fn call<T, F, Fut>(&self, peer: &Peer, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(NodeControlClient<Channel>) -> Fut,
        Fut: Future<Output = std::result::Result<tonic::Response<T>, Status>>,
    {
        let work = async {
            let client = self.connect(peer).await?;
            f(client)
                .await
                .map(tonic::Response::into_inner)
                .map_err(|status| status_error(peer, status))
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    tracing::debug!(peer = %peer, op, error = %e, "Control-plane call failed");
                }
                result
            }
            Err(_) => Err(NodeError::RpcUnreachable {
                peer: peer.to_string(),
                reason: format!("{} timed out after {:?}", op, self.timeout),
            }),
        }
    }

    pub async fn forward_web_request(
        &self,
        peer: &Peer,
        request: RemoteRequest,
    ) -> Result<RemoteResponse> {
        let response = self
            .call(peer, "forward_web_request", |mut client| async move {
                client.forward_web_request(crate::proto::WebRequest::from(request)).await
            })
            .await?;
        RemoteResponse::try_from(response).map_err(|status| status_error(peer, status))
    }

    pub async fn unload_plugin(&self, peer: &Peer, plugin: Uuid) -> Result<bool> {
        let response = self
            .call(peer, "unload_plugin", |mut client| async move {
                client
                    .unload_plugin(UnloadPluginRequest {
                        plugin_id: plugin.to_string(),
                    })
                    .await
            })
            .await?;
        Ok(response.unloaded)
    }

    /// Returns whether a handler on `peer` reported the event handled.
    pub async fn invoke_global_hook(&self, peer: &Peer, event: &GlobalEvent) -> Result<bool> {
        let request = encode_event(event, self.origin).map_err(|s| status_error(peer, s))?;
        let response = self
            .call(peer, "invoke_global_hook", |mut client| async move {
                client.invoke_global_hook(request).await
            })
            .await?;
        Ok(response.handled)
    }

    pub async fn invoke_global_hook_all(&self, peer: &Peer, event: &GlobalEvent) -> Result<()> {
        let request = encode_event(event, self.origin).map_err(|s| status_error(peer, s))?;
        self.call(peer, "invoke_global_hook_all", |mut client| async move {
            client.invoke_global_hook_all(request).await
        })
        .await?;
        Ok(())
    }

    pub async fn restart(&self, peer: &Peer) -> Result<LifecycleAck> {
        let requested_by = self.origin.to_string();
        let response = self
            .call(peer, "restart", |mut client| async move {
                client.restart(LifecycleRequest { requested_by }).await
            })
            .await?;
        Ok(LifecycleAck {
            accepted: response.accepted,
            state: response.state,
        })
    }

    pub async fn shutdown(&self, peer: &Peer) -> Result<LifecycleAck> {
        let requested_by = self.origin.to_string();
        let response = self
            .call(peer, "shutdown", |mut client| async move {
                client.shutdown(LifecycleRequest { requested_by }).await
            })
            .await?;
        Ok(LifecycleAck {
            accepted: response.accepted,
            state: response.state,
        })
    }
}

fn status_error(peer: &Peer, status: Status) -> NodeError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => NodeError::RpcUnreachable {
            peer: peer.to_string(),
            reason: status.message().to_string(),
        },
        _ => NodeError::RemoteFailure {
            peer: peer.to_string(),
            status,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_peer_parses_host_and_port() {
        let peer = Peer::direct("http://10.0.0.5:1099").unwrap();
        assert_eq!(peer.host, "10.0.0.5");
        assert_eq!(peer.port, 1099);
        assert_eq!(peer.to_string(), "10.0.0.5:1099");
        assert!(Peer::direct("10.0.0.5").is_err());
        assert!(Peer::direct("10.0.0.5:http").is_err());
    }

    #[test]
    fn unavailable_status_is_unreachable() {
        let peer = Peer::direct("127.0.0.1:1").unwrap();
        assert!(matches!(
            status_error(&peer, Status::unavailable("down")),
            NodeError::RpcUnreachable { .. }
        ));
        assert!(matches!(
            status_error(&peer, Status::invalid_argument("bad")),
            NodeError::RemoteFailure { .. }
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = PeerClient::new(Uuid::new_v4(), Duration::from_secs(2), None);
        let peer = Peer {
            uuid: Uuid::new_v4(),
            host: "127.0.0.1".into(),
            port,
        };
        let err = client
            .invoke_global_hook(&peer, &GlobalEvent::WorkWake { job_id: None })
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::RpcUnreachable { .. }));
    }
}
