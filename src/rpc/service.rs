use std::sync::Arc;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::error::NodeError;
use crate::hooks::{HookRegistry, PluginHost};
use crate::lifecycle::{LifecycleCommand, LifecycleHandle};
use crate::proto::node_control_server::NodeControl;
use crate::proto::{
    Ack, GlobalHookRequest, GlobalHookResponse, LifecycleRequest, LifecycleResponse,
    UnloadPluginRequest, UnloadPluginResponse, WebRequest, WebResponse,
};
use crate::rpc::convert::{decode_event, parse_plugin_id};
use crate::web::WebHandler;

/// Server side of the node control plane.
pub struct ControlService {
    node_uuid: Uuid,
    hooks: Arc<HookRegistry>,
    plugins: Arc<PluginHost>,
    web: Arc<dyn WebHandler>,
    lifecycle: LifecycleHandle,
}

impl ControlService {
    pub fn new(
        node_uuid: Uuid,
        hooks: Arc<HookRegistry>,
        plugins: Arc<PluginHost>,
        web: Arc<dyn WebHandler>,
        lifecycle: LifecycleHandle,
    ) -> Self {
        Self {
            node_uuid,
            hooks,
            plugins,
            web,
            lifecycle,
        }
    }

    fn lifecycle_call(
        &self,
        command: LifecycleCommand,
        requested_by: &str,
    ) -> Result<Response<LifecycleResponse>, Status> {
        tracing::info!(node = %self.node_uuid, ?command, requested_by, "Lifecycle change requested over RPC");
        match self.lifecycle.request(command) {
            Ok(state) => Ok(Response::new(LifecycleResponse {
                accepted: true,
                state: state.to_string(),
            })),
            Err(NodeError::InvalidTransition { from, .. }) => Ok(Response::new(LifecycleResponse {
                accepted: false,
                state: from.to_string(),
            })),
            Err(e) => Err(Status::unavailable(e.to_string())),
        }
    }
}

#[tonic::async_trait]
impl NodeControl for ControlService {
    async fn forward_web_request(
        &self,
        request: Request<WebRequest>,
    ) -> Result<Response<WebResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(method = %req.method, path = %req.path, "Forwarded web request");
        let response = self.web.handle(req.into()).await;
        Ok(Response::new(response.into()))
    }

    async fn unload_plugin(
        &self,
        request: Request<UnloadPluginRequest>,
    ) -> Result<Response<UnloadPluginResponse>, Status> {
        let plugin = parse_plugin_id(&request.into_inner().plugin_id)?;
        let unloaded = if plugin.is_nil() {
            false
        } else {
            self.plugins.unload(plugin).await
        };
        Ok(Response::new(UnloadPluginResponse { unloaded }))
    }

    async fn invoke_global_hook(
        &self,
        request: Request<GlobalHookRequest>,
    ) -> Result<Response<GlobalHookResponse>, Status> {
        let req = request.into_inner();
        let event = decode_event(&req)?;
        tracing::debug!(event = event.name(), origin = %req.origin_node, "Global hook received");
        let handled = self.hooks.invoke(&event).await;
        Ok(Response::new(GlobalHookResponse { handled }))
    }

    async fn invoke_global_hook_all(
        &self,
        request: Request<GlobalHookRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let event = decode_event(&req)?;
        tracing::debug!(event = event.name(), origin = %req.origin_node, "Global hook broadcast received");
        self.hooks.invoke_all(&event).await;
        Ok(Response::new(Ack {}))
    }

    async fn restart(
        &self,
        request: Request<LifecycleRequest>,
    ) -> Result<Response<LifecycleResponse>, Status> {
        let req = request.into_inner();
        self.lifecycle_call(LifecycleCommand::Restart, &req.requested_by)
    }

    async fn shutdown(
        &self,
        request: Request<LifecycleRequest>,
    ) -> Result<Response<LifecycleResponse>, Status> {
        let req = request.into_inner();
        self.lifecycle_call(LifecycleCommand::Shutdown, &req.requested_by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{EventKind, GlobalEvent, GlobalHookHandler, PluginDescriptor};
    use crate::lifecycle::{lifecycle, NodeState};
    use crate::rpc::convert::encode_event;
    use crate::web::NotFoundHandler;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct Handles;

    #[async_trait]
    impl GlobalHookHandler for Handles {
        async fn handle(&self, _event: &GlobalEvent) -> bool {
            true
        }
    }

    fn service() -> (ControlService, crate::lifecycle::LifecycleDriver, Arc<PluginHost>) {
        let hooks = Arc::new(HookRegistry::new());
        let plugins = Arc::new(PluginHost::new(hooks.clone(), PathBuf::from("plugins")));
        let (handle, driver) = lifecycle();
        let svc = ControlService::new(
            Uuid::new_v4(),
            hooks,
            plugins.clone(),
            Arc::new(NotFoundHandler),
            handle,
        );
        (svc, driver, plugins)
    }

    #[tokio::test]
    async fn restart_rejected_while_stopped() {
        let (svc, driver, _) = service();
        let resp = svc
            .restart(Request::new(LifecycleRequest {
                requested_by: "test".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.accepted);
        assert_eq!(resp.state, "stopped");
        assert_eq!(driver.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_accepted_when_started() {
        let (svc, mut driver, _) = service();
        driver.transition(NodeState::Starting).unwrap();
        driver.transition(NodeState::Started).unwrap();

        let resp = svc
            .shutdown(Request::new(LifecycleRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.accepted);
        assert_eq!(driver.next_command().await, Some(LifecycleCommand::Shutdown));
    }

    #[tokio::test]
    async fn unload_plugin_over_rpc() {
        let (svc, _driver, plugins) = service();
        let uuid = Uuid::new_v4();
        plugins
            .load(
                PluginDescriptor {
                    uuid,
                    title: "Plagiarism".into(),
                    version: "2".into(),
                },
                vec![(EventKind::CacheInvalidate, Arc::new(Handles))],
            )
            .await;

        let resp = svc
            .unload_plugin(Request::new(UnloadPluginRequest {
                plugin_id: uuid.to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.unloaded);

        let resp = svc
            .unload_plugin(Request::new(UnloadPluginRequest {
                plugin_id: Uuid::nil().to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.unloaded);
    }

    #[tokio::test]
    async fn hook_without_handlers_is_unhandled() {
        let (svc, _driver, _) = service();
        let req = encode_event(&GlobalEvent::WorkWake { job_id: None }, Uuid::nil()).unwrap();
        let resp = svc
            .invoke_global_hook(Request::new(req))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.handled);
    }
}
