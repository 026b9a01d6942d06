use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::hooks::{EventKind, GlobalHookHandler, HookRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    pub uuid: Uuid,
    pub title: String,
    pub version: String,
}

/// Plugins loaded in this node and the hooks they own.
pub struct PluginHost {
    plugins: RwLock<HashMap<Uuid, PluginDescriptor>>,
    hooks: Arc<HookRegistry>,
    search_path: PathBuf,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("search_path", &self.search_path)
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    pub fn new(hooks: Arc<HookRegistry>, search_path: PathBuf) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            hooks,
            search_path,
        }
    }

    pub fn search_path(&self) -> &Path {
        &self.search_path
    }

    /// Load a plugin and subscribe its handlers. Reloading a uuid replaces
    /// the previous instance and its handlers.
    pub async fn load(
        &self,
        descriptor: PluginDescriptor,
        subscriptions: Vec<(EventKind, Arc<dyn GlobalHookHandler>)>,
    ) {
        let uuid = descriptor.uuid;
        if self.plugins.read().await.contains_key(&uuid) {
            self.unload(uuid).await;
        }
        for (kind, handler) in subscriptions {
            self.hooks.subscribe(kind, Some(uuid), handler).await;
        }
        tracing::info!(plugin = %uuid, title = %descriptor.title, "Plugin loaded");
        self.plugins.write().await.insert(uuid, descriptor);
    }

    /// Unload a plugin and drop its hook handlers. Unknown plugins are a no-op.
    pub async fn unload(&self, uuid: Uuid) -> bool {
        let Some(descriptor) = self.plugins.write().await.remove(&uuid) else {
            tracing::debug!(plugin = %uuid, "Unload requested for unknown plugin");
            return false;
        };
        let handlers = self.hooks.unsubscribe_owner(uuid).await;
        tracing::info!(plugin = %uuid, title = %descriptor.title, handlers, "Plugin unloaded");
        true
    }

    pub async fn get(&self, uuid: Uuid) -> Option<PluginDescriptor> {
        self.plugins.read().await.get(&uuid).cloned()
    }

    pub async fn list(&self) -> Vec<PluginDescriptor> {
        let mut plugins: Vec<_> = self.plugins.read().await.values().cloned().collect();
        plugins.sort_by(|a, b| a.title.cmp(&b.title));
        plugins
    }
}
