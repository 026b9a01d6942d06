pub mod broadcast;
pub mod config;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod node;
pub mod queue;
pub mod registry;
pub mod rpc;
pub mod shutdown;
pub mod store;
pub mod tls;
pub mod web;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("control");
}
