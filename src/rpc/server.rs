use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::error::{NodeError, Result};
use crate::proto::node_control_server::NodeControlServer;
use crate::rpc::service::ControlService;
use crate::tls::TlsIdentity;

/// The control-plane listener of one node.
///
/// Binding is separate from serving so that a port conflict fails node
/// startup instead of surfacing later from a background task.
pub struct RpcServer {
    listener: TcpListener,
    service: ControlService,
    tls_identity: Option<TlsIdentity>,
}

impl RpcServer {
    pub async fn bind(
        addr: SocketAddr,
        service: ControlService,
        tls_identity: Option<TlsIdentity>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NodeError::Config(format!("cannot bind RPC listener on {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            service,
            tls_identity,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| NodeError::Internal(e.to_string()))
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let mut builder = Server::builder();
        if let Some(ref identity) = self.tls_identity {
            builder = builder
                .tls_config(identity.server_tls_config())
                .map_err(|e| NodeError::Config(format!("TLS config error: {}", e)))?;
        }

        tracing::info!(addr = %addr, tls = self.tls_identity.is_some(), "Starting control-plane server");

        builder
            .add_service(NodeControlServer::new(self.service))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(self.listener),
                cancel.cancelled_owned(),
            )
            .await
            .map_err(|e| NodeError::Internal(format!("control-plane server failed: {}", e)))?;

        tracing::info!(addr = %addr, "Control-plane server stopped");
        Ok(())
    }
}
