//! Node control plane over gRPC.
//!
//! - [`service`]: the `NodeControl` implementation each node serves
//! - [`server`]: listener setup with optional mTLS
//! - [`client`]: per-call clients used to reach peers

pub mod client;
pub mod convert;
pub mod server;
pub mod service;

pub use client::{LifecycleAck, Peer, PeerClient};
pub use server::RpcServer;
pub use service::ControlService;
