//! Cluster layer: seeding, node discovery and cross-node retry

pub mod config;
pub mod discovery;
pub mod host_pool;
pub mod manager;
pub mod node;

pub use config::{ConnectOpts, HandshakeVersion, Host, DEFAULT_PORT};
pub use discovery::ServerStatus;
pub use host_pool::HostPool;
pub use manager::Cluster;
pub use node::{Node, NodeId};
