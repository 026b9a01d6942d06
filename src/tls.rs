//! Certificate loading for the node control plane.
//!
//! Every node presents a certificate signed by the cluster CA and only accepts
//! peers presenting one too (mTLS).

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Name certificates are issued for; nodes dial each other by IP.
pub const CLUSTER_DOMAIN: &str = "markhive-cluster";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("no CA certificate configured")]
    MissingCaCert,

    #[error("no node certificate configured")]
    MissingCert,

    #[error("no node private key configured")]
    MissingKey,

    #[error("CA certificate {0} does not exist")]
    CaCertNotFound(PathBuf),

    #[error("node certificate {0} does not exist")]
    CertNotFound(PathBuf),

    #[error("node private key {0} does not exist")]
    KeyNotFound(PathBuf),

    #[error("TLS enabled but certificate paths are incomplete")]
    Incomplete,

    #[error("reading PEM file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Node identity and cluster CA, ready for tonic.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}

/// Read a PEM file, reporting a missing file with `not_found`.
async fn read_pem(
    path: Option<&PathBuf>,
    unset: TlsError,
    not_found: fn(PathBuf) -> TlsError,
) -> Result<Vec<u8>, TlsError> {
    let path = path.ok_or(unset)?;
    match fs::read(path).await {
        Ok(pem) => Ok(pem),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(path.clone())),
        Err(e) => Err(e.into()),
    }
}

impl TlsIdentity {
    /// Read the CA, certificate and key named by `config`, in that order.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca = read_pem(
            config.ca_cert_path.as_ref(),
            TlsError::MissingCaCert,
            TlsError::CaCertNotFound,
        )
        .await?;
        let cert = read_pem(
            config.cert_path.as_ref(),
            TlsError::MissingCert,
            TlsError::CertNotFound,
        )
        .await?;
        let key = read_pem(
            config.key_path.as_ref(),
            TlsError::MissingKey,
            TlsError::KeyNotFound,
        )
        .await?;

        Ok(Self {
            identity: Identity::from_pem(cert, key),
            ca_cert: Certificate::from_pem(ca),
        })
    }

    /// Resolve the effective transport security for a node.
    ///
    /// `Ok(None)` means plaintext, which is only returned when TLS is disabled
    /// or `allow_insecure` is set.
    pub async fn from_config(config: &TlsConfig) -> Result<Option<Self>, TlsError> {
        if !config.enabled {
            return Ok(None);
        }
        if !config.is_complete() {
            if config.allow_insecure {
                tracing::warn!("TLS enabled but certificate paths incomplete, running in insecure mode");
                return Ok(None);
            }
            return Err(TlsError::Incomplete);
        }
        match Self::load(config).await {
            Ok(identity) => {
                tracing::info!("TLS enabled with mTLS authentication");
                Ok(Some(identity))
            }
            Err(e) if config.allow_insecure => {
                tracing::warn!(error = %e, "TLS certificate loading failed, running in insecure mode");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Server side: present our certificate and require a CA-signed client.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client side: verify the peer against the CA and present our certificate.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(CLUSTER_DOMAIN)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}
