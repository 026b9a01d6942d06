use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::hooks::{EventKind, GlobalEvent, HookRegistry, PluginHost};
use crate::lifecycle::{lifecycle, LifecycleCommand, LifecycleDriver, LifecycleHandle, NodeState};
use crate::queue::{
    Coordinator, CoordinatorConfig, ExecutorRegistry, JobStore, MarkingExecutor, WakeHandler,
};
use crate::registry::{HeartbeatPublisher, NodeRegistration, NodeRegistry, PeerDirectory};
use crate::rpc::{ControlService, PeerClient, RpcServer};
use crate::store::{Store, StoreOptions};
use crate::tls::TlsIdentity;
use crate::web::{NotFoundHandler, WebHandler};

/// Node-scoped collaborators, built once and shared by every run generation.
#[derive(Clone)]
pub struct NodeContext {
    pub config: NodeConfig,
    pub hooks: Arc<HookRegistry>,
    pub plugins: Arc<PluginHost>,
    pub executors: Arc<ExecutorRegistry>,
    pub web: Arc<dyn WebHandler>,
    pub directory: PeerDirectory,
    pub wake: Arc<Notify>,
    pub lifecycle: LifecycleHandle,
}

/// Everything started by one `Starting -> Started` pass. A restart stops the
/// generation and builds a new one.
struct Generation {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    store: Arc<Store>,
    broadcaster: Arc<Broadcaster>,
}

/// Node supervisor: owns the lifecycle and starts or stops the subsystems.
pub struct Node {
    ctx: NodeContext,
    driver: LifecycleDriver,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let (handle, driver) = lifecycle();
        let hooks = Arc::new(HookRegistry::new());
        let plugins = Arc::new(PluginHost::new(
            hooks.clone(),
            config.plugins.search_path(Path::new(".")),
        ));
        let executors = Arc::new(ExecutorRegistry::new());

        Self {
            ctx: NodeContext {
                config,
                hooks,
                plugins,
                executors,
                web: Arc::new(NotFoundHandler),
                directory: PeerDirectory::new(),
                wake: Arc::new(Notify::new()),
                lifecycle: handle,
            },
            driver,
        }
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.ctx.executors = Arc::new(executors);
        self
    }

    pub fn with_executor(mut self, kind: &str, executor: Arc<dyn MarkingExecutor>) -> Self {
        let mut executors = (*self.ctx.executors).clone();
        executors.register(kind, executor);
        self.ctx.executors = Arc::new(executors);
        self
    }

    pub fn with_web_handler(mut self, web: Arc<dyn WebHandler>) -> Self {
        self.ctx.web = web;
        self
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn handle(&self) -> LifecycleHandle {
        self.ctx.lifecycle.clone()
    }

    /// Run until shut down.
    ///
    /// Restart requests stop every task of the current generation, wait for
    /// in-flight jobs and start again. A startup fault moves the node to
    /// `Failed` and is returned.
    pub async fn run(mut self) -> Result<()> {
        self.ctx.config.validate()?;
        self.ctx
            .hooks
            .subscribe(
                EventKind::WorkWake,
                None,
                Arc::new(WakeHandler::new(self.ctx.wake.clone())),
            )
            .await;

        loop {
            self.driver.transition(NodeState::Starting)?;
            let generation = match self.start_generation().await {
                Ok(generation) => generation,
                Err(e) => {
                    tracing::error!(node = %self.ctx.config.node_uuid, error = %e, "Node failed to start");
                    self.driver.transition(NodeState::Failed)?;
                    return Err(e);
                }
            };
            self.driver.transition(NodeState::Started)?;

            match self.driver.next_command().await {
                Some(LifecycleCommand::Restart) => {
                    self.driver.transition(NodeState::Restarting)?;
                    let event = GlobalEvent::NodeRestarting {
                        node: self.ctx.config.node_uuid,
                    };
                    generation.broadcaster.broadcast_all(&event).await;
                    Self::stop_generation(generation).await;
                    let dropped = self.driver.drain_queued();
                    if dropped > 0 {
                        tracing::debug!(dropped, "Dropped restarts queued during restart");
                    }
                    if self.driver.shutdown_pending() {
                        tracing::info!("Shutdown requested during restart, stopping after startup");
                    }
                }
                Some(LifecycleCommand::Shutdown) | None => {
                    self.driver.transition(NodeState::ShuttingDown)?;
                    Self::stop_generation(generation).await;
                    self.driver.transition(NodeState::Shutdown)?;
                    return Ok(());
                }
            }
        }
    }

    async fn start_generation(&self) -> Result<Generation> {
        let config = &self.ctx.config;
        let node_uuid = config.node_uuid;

        let store = Arc::new(
            Store::open(
                StoreOptions::new(config.database_url.clone())
                    .with_lock_timeout(config.lock_timeout()),
            )
            .await?,
        );

        let tls_identity = TlsIdentity::from_config(&config.tls).await?;

        let server = match config.advertise_host {
            Some(_) => {
                let service = ControlService::new(
                    node_uuid,
                    self.ctx.hooks.clone(),
                    self.ctx.plugins.clone(),
                    self.ctx.web.clone(),
                    self.ctx.lifecycle.clone(),
                );
                Some(RpcServer::bind(config.listen_addr, service, tls_identity.clone()).await?)
            }
            None => None,
        };
        let bound: Option<SocketAddr> = server.as_ref().map(RpcServer::local_addr).transpose()?;

        let registration = NodeRegistration {
            uuid: node_uuid,
            title: config.title.clone(),
            rpc_endpoint: match (&config.advertise_host, bound) {
                (Some(host), Some(addr)) => Some((host.clone(), addr.port())),
                _ => None,
            },
        };
        let registry = Arc::new(NodeRegistry::new(store.clone(), config.liveness_threshold()));
        registry.register(&registration).await?;

        let client = PeerClient::new(node_uuid, config.rpc_timeout(), tls_identity);
        let broadcaster = Arc::new(Broadcaster::new(
            node_uuid,
            registry.clone(),
            self.ctx.directory.clone(),
            client,
            self.ctx.hooks.clone(),
        ));

        let coordinator = Arc::new(Coordinator::new(
            node_uuid,
            JobStore::new(store.clone()),
            self.ctx.executors.clone(),
            self.ctx.wake.clone(),
            CoordinatorConfig::from_node(config),
        ));

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let heartbeat = HeartbeatPublisher::new(
            registry,
            self.ctx.directory.clone(),
            registration,
            config.heartbeat_interval(),
        );
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { heartbeat.run(token).await }));

        tasks.push(tokio::spawn(coordinator.clone().run_reaper(cancel.clone())));
        for worker in 0..config.worker_count {
            tasks.push(tokio::spawn(
                coordinator.clone().run_worker(worker, cancel.clone()),
            ));
        }

        if let Some(server) = server {
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.serve(token).await {
                    tracing::error!(error = %e, "Control-plane server error");
                }
            }));
        }

        tracing::info!(
            node = %node_uuid,
            title = %config.title,
            rpc = ?bound,
            workers = config.worker_count,
            executors = ?self.ctx.executors.kinds(),
            plugins = %self.ctx.plugins.search_path().display(),
            "Node started"
        );

        Ok(Generation {
            cancel,
            tasks,
            store,
            broadcaster,
        })
    }

    async fn stop_generation(generation: Generation) {
        generation.cancel.cancel();
        for task in generation.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Node task ended abnormally");
            }
        }
        generation.store.close().await;
        tracing::info!("Node subsystems stopped");
    }
}
