//! Global hooks: typed cluster events and the local handler registry.
//!
//! Handlers subscribe to an [`EventKind`]. An event is either offered to
//! handlers until one reports it handled ([`HookRegistry::invoke`]) or
//! delivered to every handler ([`HookRegistry::invoke_all`]).

pub mod plugins;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

pub use plugins::{PluginDescriptor, PluginHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    WorkWake,
    PluginUnloaded,
    NodeRestarting,
    CacheInvalidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GlobalEvent {
    /// New work is waiting in the job queue.
    WorkWake { job_id: Option<i64> },
    PluginUnloaded { plugin: Uuid },
    NodeRestarting { node: Uuid },
    CacheInvalidate { key: String },
}

impl GlobalEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GlobalEvent::WorkWake { .. } => EventKind::WorkWake,
            GlobalEvent::PluginUnloaded { .. } => EventKind::PluginUnloaded,
            GlobalEvent::NodeRestarting { .. } => EventKind::NodeRestarting,
            GlobalEvent::CacheInvalidate { .. } => EventKind::CacheInvalidate,
        }
    }

    /// Dotted name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            GlobalEvent::WorkWake { .. } => "work.wake",
            GlobalEvent::PluginUnloaded { .. } => "plugin.unloaded",
            GlobalEvent::NodeRestarting { .. } => "node.restarting",
            GlobalEvent::CacheInvalidate { .. } => "cache.invalidate",
        }
    }
}

/// A local subscriber to global events.
#[async_trait]
pub trait GlobalHookHandler: Send + Sync {
    /// Returns true if the event was handled.
    async fn handle(&self, event: &GlobalEvent) -> bool;
}

#[derive(Clone)]
struct Subscription {
    /// Plugin that owns the handler; `None` for node built-ins.
    owner: Option<Uuid>,
    handler: Arc<dyn GlobalHookHandler>,
}

#[derive(Default)]
pub struct HookRegistry {
    handlers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry").finish_non_exhaustive()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(
        &self,
        kind: EventKind,
        owner: Option<Uuid>,
        handler: Arc<dyn GlobalHookHandler>,
    ) {
        self.handlers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(Subscription { owner, handler });
    }

    /// Drop every handler owned by `owner`. Returns how many were removed.
    pub async fn unsubscribe_owner(&self, owner: Uuid) -> usize {
        let mut handlers = self.handlers.write().await;
        let mut removed = 0;
        for subs in handlers.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.owner != Some(owner));
            removed += before - subs.len();
        }
        handlers.retain(|_, subs| !subs.is_empty());
        removed
    }

    pub async fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().await.get(&kind).map_or(0, Vec::len)
    }

    async fn snapshot(&self, kind: EventKind) -> Vec<Arc<dyn GlobalHookHandler>> {
        self.handlers
            .read()
            .await
            .get(&kind)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Offer `event` to handlers in subscription order, stopping at the first
    /// that handles it.
    pub async fn invoke(&self, event: &GlobalEvent) -> bool {
        for handler in self.snapshot(event.kind()).await {
            if handler.handle(event).await {
                tracing::debug!(event = event.name(), "Global hook handled");
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every handler, ignoring results.
    pub async fn invoke_all(&self, event: &GlobalEvent) {
        let handlers = self.snapshot(event.kind()).await;
        tracing::debug!(event = event.name(), handlers = handlers.len(), "Dispatching global hook to all handlers");
        for handler in handlers {
            handler.handle(event).await;
        }
    }
}
