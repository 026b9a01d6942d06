use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::registry::{NodeRegistration, NodeRegistry, PeerDirectory};

/// Publishes this node's heartbeat and refreshes the peer directory.
///
/// Store failures are logged and retried on the next tick; they never stop
/// the publisher.
pub struct HeartbeatPublisher {
    registry: Arc<NodeRegistry>,
    directory: PeerDirectory,
    registration: NodeRegistration,
    interval: Duration,
}

impl HeartbeatPublisher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        directory: PeerDirectory,
        registration: NodeRegistration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            directory,
            registration,
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
        tracing::debug!(node = %self.registration.uuid, "Heartbeat publisher stopped");
    }

    pub async fn tick(&self) {
        let uuid = self.registration.uuid;
        match self.registry.heartbeat(uuid).await {
            Ok(true) => tracing::trace!(node = %uuid, "Heartbeat published"),
            Ok(false) => {
                // Row vanished (store rebuilt); put ourselves back.
                tracing::warn!(node = %uuid, "Node row missing, re-registering");
                if let Err(e) = self.registry.register(&self.registration).await {
                    tracing::error!(node = %uuid, error = %e, "Failed to re-register node");
                }
            }
            Err(e) => {
                tracing::error!(node = %uuid, error = %e, "Failed to publish heartbeat");
            }
        }

        match self.registry.list_online().await {
            Ok(nodes) => self.directory.replace(nodes).await,
            Err(e) => tracing::warn!(error = %e, "Failed to refresh peer directory"),
        }
    }
}
