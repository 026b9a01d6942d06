//! Node registry and liveness.
//!
//! The `nodes` table is the durable membership record of the cluster. Rows
//! are upserted by their own node at startup, refreshed by that node's
//! heartbeat publisher and never deleted by peers. Liveness is derived:
//! a node is online iff `now - last_heartbeat < liveness_threshold`.

pub mod heartbeat;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{NodeError, Result};
use crate::store::{from_millis, to_millis, Store};

pub use heartbeat::HeartbeatPublisher;

/// Identity a node publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistration {
    pub uuid: Uuid,
    pub title: String,
    /// `None` when the node does not export the control plane.
    pub rpc_endpoint: Option<(String, u16)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    pub uuid: Uuid,
    pub title: String,
    pub rpc_host: Option<String>,
    pub rpc_port: Option<u16>,
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeRecord {
    pub fn rpc_endpoint(&self) -> Option<(&str, u16)> {
        match (&self.rpc_host, self.rpc_port) {
            (Some(host), Some(port)) => Some((host.as_str(), port)),
            _ => None,
        }
    }

    pub fn is_online_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let age_ms = (now - self.last_heartbeat).num_milliseconds();
        i128::from(age_ms) < threshold.as_millis() as i128
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let rpc_port: Option<i64> = row.try_get("rpc_port")?;
        let rpc_port = rpc_port
            .map(|p| {
                u16::try_from(p).map_err(|_| NodeError::QueryFailure(format!("invalid rpc_port {}", p)))
            })
            .transpose()?;
        Ok(Self {
            uuid: row.try_get("uuid")?,
            title: row.try_get("title")?,
            rpc_host: row.try_get("rpc_host")?,
            rpc_port,
            last_heartbeat: from_millis(row.try_get("last_heartbeat")?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeRegistry {
    store: Arc<Store>,
    liveness_threshold: Duration,
}

impl NodeRegistry {
    pub fn new(store: Arc<Store>, liveness_threshold: Duration) -> Self {
        Self {
            store,
            liveness_threshold,
        }
    }

    pub fn liveness_threshold(&self) -> Duration {
        self.liveness_threshold
    }

    /// Upsert a node's identity and RPC endpoint. Idempotent.
    pub async fn register(&self, node: &NodeRegistration) -> Result<()> {
        let (host, port) = match &node.rpc_endpoint {
            Some((host, port)) => (Some(host.as_str()), Some(i64::from(*port))),
            None => (None, None),
        };
        sqlx::query(
            "INSERT INTO nodes (uuid, title, rpc_host, rpc_port, last_heartbeat)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(uuid) DO UPDATE SET
                title = excluded.title,
                rpc_host = excluded.rpc_host,
                rpc_port = excluded.rpc_port,
                last_heartbeat = excluded.last_heartbeat",
        )
        .bind(node.uuid)
        .bind(&node.title)
        .bind(host)
        .bind(port)
        .bind(to_millis(Utc::now()))
        .execute(self.store.pool()?)
        .await?;

        tracing::info!(node = %node.uuid, title = %node.title, rpc = ?node.rpc_endpoint, "Node registered");
        Ok(())
    }

    /// Stamp `last_heartbeat = now`. Returns false if the node has no row.
    pub async fn heartbeat(&self, uuid: Uuid) -> Result<bool> {
        self.heartbeat_at(uuid, Utc::now()).await
    }

    pub async fn heartbeat_at(&self, uuid: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE nodes SET last_heartbeat = ? WHERE uuid = ?")
            .bind(to_millis(at))
            .bind(uuid)
            .execute(self.store.pool()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, uuid: Uuid) -> Result<Option<NodeRecord>> {
        let row = sqlx::query(
            "SELECT uuid, title, rpc_host, rpc_port, last_heartbeat FROM nodes WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(self.store.pool()?)
        .await?;
        row.as_ref().map(NodeRecord::from_row).transpose()
    }

    /// Every node ever registered, online or not.
    pub async fn list_all(&self) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query(
            "SELECT uuid, title, rpc_host, rpc_port, last_heartbeat FROM nodes ORDER BY title, uuid",
        )
        .fetch_all(self.store.pool()?)
        .await?;
        rows.iter().map(NodeRecord::from_row).collect()
    }

    pub async fn list_online(&self) -> Result<Vec<NodeRecord>> {
        self.list_online_at(Utc::now()).await
    }

    /// Nodes whose heartbeat age at `now` is below the liveness threshold.
    pub async fn list_online_at(&self, now: DateTime<Utc>) -> Result<Vec<NodeRecord>> {
        let cutoff = to_millis(now) - self.liveness_threshold.as_millis() as i64;
        let rows = sqlx::query(
            "SELECT uuid, title, rpc_host, rpc_port, last_heartbeat FROM nodes
             WHERE last_heartbeat > ? ORDER BY title, uuid",
        )
        .bind(cutoff)
        .fetch_all(self.store.pool()?)
        .await?;
        rows.iter().map(NodeRecord::from_row).collect()
    }
}

/// Cached view of the online peers, refreshed on every heartbeat tick.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<RwLock<Vec<NodeRecord>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace(&self, nodes: Vec<NodeRecord>) {
        *self.peers.write().await = nodes;
    }

    pub async fn snapshot(&self) -> Vec<NodeRecord> {
        self.peers.read().await.clone()
    }
}
