//! Fan-out of global events to the rest of the cluster.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use crate::hooks::{GlobalEvent, HookRegistry};
use crate::registry::{NodeRegistry, PeerDirectory};
use crate::rpc::{Peer, PeerClient};

/// Outcome of one fan-out. Failures are counted, never propagated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct Broadcaster {
    self_uuid: Uuid,
    registry: Arc<NodeRegistry>,
    directory: PeerDirectory,
    client: PeerClient,
    hooks: Arc<HookRegistry>,
}

impl Broadcaster {
    pub fn new(
        self_uuid: Uuid,
        registry: Arc<NodeRegistry>,
        directory: PeerDirectory,
        client: PeerClient,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            self_uuid,
            registry,
            directory,
            client,
            hooks,
        }
    }

    /// Online peers with an RPC endpoint, excluding this node.
    ///
    /// Reads the heartbeat-refreshed directory and falls back to the registry
    /// when the directory has not been filled yet.
    pub async fn targets(&self) -> Vec<Peer> {
        let mut nodes = self.directory.snapshot().await;
        if nodes.is_empty() {
            nodes = match self.registry.list_online().await {
                Ok(nodes) => nodes,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to list online nodes for broadcast");
                    Vec::new()
                }
            };
        }
        nodes
            .iter()
            .filter(|n| n.uuid != self.self_uuid)
            .filter_map(Peer::from_record)
            .collect()
    }

    /// Deliver `event` to every handler on every online node, this one included.
    pub async fn broadcast_all(&self, event: &GlobalEvent) -> BroadcastReport {
        self.hooks.invoke_all(event).await;

        let peers = self.targets().await;
        let calls = peers.iter().map(|peer| async move {
            let result = self.client.invoke_global_hook_all(peer, event).await;
            if let Err(ref e) = result {
                tracing::warn!(peer = %peer, event = event.name(), error = %e, "Broadcast to peer failed");
            }
            result.is_ok()
        });
        let results = join_all(calls).await;

        let delivered = results.iter().filter(|ok| **ok).count();
        let report = BroadcastReport {
            delivered,
            failed: results.len() - delivered,
        };
        tracing::debug!(event = event.name(), delivered = report.delivered, failed = report.failed, "Broadcast finished");
        report
    }

    /// Tell every node there is new work.
    pub async fn wake_all(&self, job_id: Option<i64>) -> BroadcastReport {
        self.broadcast_all(&GlobalEvent::WorkWake { job_id }).await
    }

    /// Offer `event` locally, then to peers in registry order, until one
    /// handles it. Unreachable peers are skipped.
    pub async fn first_responder(&self, event: &GlobalEvent) -> bool {
        if self.hooks.invoke(event).await {
            return true;
        }
        for peer in self.targets().await {
            match self.client.invoke_global_hook(&peer, event).await {
                Ok(true) => {
                    tracing::debug!(peer = %peer, event = event.name(), "Peer handled event");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(peer = %peer, event = event.name(), error = %e, "Skipping unreachable peer");
                }
            }
        }
        false
    }

    /// Ask every peer to unload `plugin`. The local unload is the caller's job.
    pub async fn unload_plugin_everywhere(&self, plugin: Uuid) -> BroadcastReport {
        let peers = self.targets().await;
        let calls = peers.iter().map(|peer| async move {
            match self.client.unload_plugin(peer, plugin).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(peer = %peer, plugin = %plugin, error = %e, "Remote plugin unload failed");
                    false
                }
            }
        });
        let results = join_all(calls).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        BroadcastReport {
            delivered,
            failed: results.len() - delivered,
        }
    }
}
