use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::NodeState;
use crate::queue::executor::ExecutorError;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Store connection failed: {0}")]
    ConnectionFailure(String),

    #[error("Store is already connected")]
    AlreadyConnected,

    #[error("Query failed: {0}")]
    QueryFailure(String),

    #[error("Peer {peer} unreachable: {reason}")]
    RpcUnreachable { peer: String, reason: String },

    #[error("Peer {peer} rejected call: {status}")]
    RemoteFailure { peer: String, status: tonic::Status },

    #[error("Timed out waiting for the {0} lock")]
    LockTimeout(&'static str),

    #[error("Executor failed job {job_id}: {source}")]
    ExecutorFailure {
        job_id: i64,
        #[source]
        source: ExecutorError,
    },

    #[error("Job {job_id} is no longer claimed by node {node}")]
    ClaimLost { job_id: i64, node: Uuid },

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition { from: NodeState, to: NodeState },

    #[error("TLS error: {0}")]
    Tls(#[from] crate::tls::TlsError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Errors the owning loop should simply retry on its next tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NodeError::ConnectionFailure(_)
                | NodeError::QueryFailure(_)
                | NodeError::RpcUnreachable { .. }
                | NodeError::RemoteFailure { .. }
                | NodeError::LockTimeout(_)
                | NodeError::ClaimLost { .. }
        )
    }
}

impl From<sqlx::Error> for NodeError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_)
            | sqlx::Error::Tls(_) => NodeError::ConnectionFailure(err.to_string()),
            sqlx::Error::Database(ref db) if is_busy(db.code().as_deref()) => {
                NodeError::LockTimeout("store")
            }
            other => NodeError::QueryFailure(other.to_string()),
        }
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
pub(crate) fn is_busy(code: Option<&str>) -> bool {
    match code.and_then(|c| c.parse::<i32>().ok()) {
        Some(code) => matches!(code & 0xff, 5 | 6),
        None => false,
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
