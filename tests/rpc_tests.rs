//! Control-plane calls against running nodes.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use markhive::error::NodeError;
use markhive::hooks::{EventKind, GlobalEvent, GlobalHookHandler, PluginDescriptor};
use markhive::lifecycle::{LifecycleCommand, NodeState};
use markhive::node::Node;
use markhive::registry::NodeRegistry;
use markhive::rpc::{Peer, PeerClient};
use markhive::web::{RemoteRequest, RemoteResponse, WebHandler};
use test_harness::{test_node_config, wait_until, TestDb, TestNode};

struct Counting {
    calls: AtomicUsize,
    handles: bool,
}

impl Counting {
    fn new(handles: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            handles,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GlobalHookHandler for Counting {
    async fn handle(&self, _event: &GlobalEvent) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.handles
    }
}

struct Echo;

#[async_trait]
impl WebHandler for Echo {
    async fn handle(&self, request: RemoteRequest) -> RemoteResponse {
        let mut response = RemoteResponse::new(200, request.body);
        response
            .headers
            .push(("x-path".to_string(), request.path.clone()));
        response
    }
}

fn client() -> PeerClient {
    PeerClient::new(Uuid::new_v4(), Duration::from_secs(2), None)
}

fn peer_of(node: &TestNode) -> Peer {
    Peer {
        uuid: node.uuid,
        host: "127.0.0.1".to_string(),
        port: node.port,
    }
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_invoke_stops_at_first_handler_but_all_reaches_everyone() {
    let db = TestDb::new();
    let node = Node::new(test_node_config(&db, 47310));
    let declines = Counting::new(false);
    let handles = Counting::new(true);
    let last = Counting::new(true);
    for handler in [declines.clone(), handles.clone(), last.clone()] {
        node.context()
            .hooks
            .subscribe(EventKind::CacheInvalidate, None, handler)
            .await;
    }
    let node = TestNode::start(node).await;
    let event = GlobalEvent::CacheInvalidate {
        key: "course:42".to_string(),
    };

    let handled = client().invoke_global_hook(&peer_of(&node), &event).await.unwrap();
    assert!(handled);
    assert_eq!((declines.calls(), handles.calls(), last.calls()), (1, 1, 0));

    client()
        .invoke_global_hook_all(&peer_of(&node), &event)
        .await
        .unwrap();
    assert_eq!((declines.calls(), handles.calls(), last.calls()), (2, 2, 1));
}

#[tokio::test]
async fn test_forward_web_request_reaches_local_handler() {
    let db = TestDb::new();
    let node = TestNode::start(
        Node::new(test_node_config(&db, 47311)).with_web_handler(Arc::new(Echo)),
    )
    .await;

    let response = client()
        .forward_web_request(
            &peer_of(&node),
            RemoteRequest {
                method: "POST".to_string(),
                path: "/assignment/7/submit".to_string(),
                body: b"answer".to_vec(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"answer");
    assert_eq!(
        response.headers,
        vec![("x-path".to_string(), "/assignment/7/submit".to_string())]
    );
}

#[tokio::test]
async fn test_unload_plugin_drops_its_handlers() {
    let db = TestDb::new();
    let node = TestNode::start(Node::new(test_node_config(&db, 47312))).await;
    let plugin = Uuid::new_v4();
    node.context
        .plugins
        .load(
            PluginDescriptor {
                uuid: plugin,
                title: "Similarity Checker".to_string(),
                version: "1.2".to_string(),
            },
            vec![(EventKind::CacheInvalidate, Counting::new(true) as Arc<dyn GlobalHookHandler>)],
        )
        .await;

    assert!(client().unload_plugin(&peer_of(&node), plugin).await.unwrap());
    assert!(node.context.plugins.get(plugin).await.is_none());
    assert_eq!(
        node.context.hooks.handler_count(EventKind::CacheInvalidate).await,
        0
    );

    // Unknown and nil ids are no-ops.
    assert!(!client().unload_plugin(&peer_of(&node), plugin).await.unwrap());
    assert!(!client().unload_plugin(&peer_of(&node), Uuid::nil()).await.unwrap());
}

#[tokio::test]
async fn test_unreachable_peer_leaves_caller_running() {
    let db = TestDb::new();
    let node = TestNode::start(Node::new(test_node_config(&db, 47313))).await;

    let nobody = Peer {
        uuid: Uuid::new_v4(),
        host: "127.0.0.1".to_string(),
        port: unused_port(),
    };
    let err = client().restart(&nobody).await.unwrap_err();
    assert!(matches!(err, NodeError::RpcUnreachable { .. }), "got {err}");

    let registry = NodeRegistry::new(db.open().await, Duration::from_secs(60));
    let err = PeerClient::resolve(&registry, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, NodeError::RpcUnreachable { .. }));

    // The registered node resolves to its advertised endpoint.
    let resolved = PeerClient::resolve(&registry, node.uuid).await.unwrap();
    assert_eq!(resolved.port, node.port);

    assert_eq!(node.state(), NodeState::Started);
}

#[tokio::test]
async fn test_restart_over_rpc_cycles_back_to_started() {
    let db = TestDb::new();
    let node = Node::new(test_node_config(&db, 47314));
    let restarting = Counting::new(true);
    node.context()
        .hooks
        .subscribe(EventKind::NodeRestarting, None, restarting.clone())
        .await;
    let node = TestNode::start(node).await;

    let mut states = node.lifecycle.subscribe();
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            seen.push(state);
            if state == NodeState::Started {
                break;
            }
        }
        seen
    });

    let ack = client().restart(&peer_of(&node)).await.unwrap();
    assert!(ack.accepted);
    assert_eq!(ack.state, "started");

    let seen = tokio::time::timeout(Duration::from_secs(10), observer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.last(), Some(&NodeState::Started), "saw {:?}", seen);
    // The restart announced itself to local handlers exactly once.
    assert_eq!(restarting.calls(), 1);

    // The new generation serves the control plane again.
    let peer = peer_of(&node);
    let back = wait_until(Duration::from_secs(5), || {
        let peer = peer.clone();
        async move {
            client()
                .invoke_global_hook(&peer, &GlobalEvent::WorkWake { job_id: None })
                .await
                .is_ok()
        }
    })
    .await;
    assert!(back);
}

#[tokio::test]
async fn test_shutdown_over_rpc_stops_node() {
    let db = TestDb::new();
    let mut node = TestNode::start(Node::new(test_node_config(&db, 47315))).await;

    let ack = client().shutdown(&peer_of(&node)).await.unwrap();
    assert!(ack.accepted);

    node.join().await.unwrap();
    assert_eq!(node.state(), NodeState::Shutdown);

    let err = client()
        .invoke_global_hook(&peer_of(&node), &GlobalEvent::WorkWake { job_id: None })
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::RpcUnreachable { .. }));
}

#[tokio::test]
async fn test_local_restart_then_shutdown_stops_node() {
    let db = TestDb::new();
    let mut node = TestNode::start(Node::new(test_node_config(&db, 47317))).await;

    node.lifecycle.request(LifecycleCommand::Restart).unwrap();
    // Accepted while the restart is queued or running; it must still land.
    node.lifecycle.request(LifecycleCommand::Shutdown).unwrap();

    tokio::time::timeout(Duration::from_secs(10), node.join())
        .await
        .expect("an accepted shutdown must stop the node")
        .unwrap();
    assert_eq!(node.state(), NodeState::Shutdown);
}
