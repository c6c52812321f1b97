//! Cluster Module
//!
//! Provides gossip-based horizontal clustering for VibeBus.
//!
//! # Architecture
//!
//! The cluster uses two communication channels:
//! - **Gossip (UDP via chitchat)**: Node discovery and membership
//! - **Peer TCP**: Ordered delivery of cluster operations between nodes
//!
//! Both sit behind [`ClusterTransport`](crate::remote::ClusterTransport);
//! [`LoopbackCluster`] implements the same seam in-process.
//!
//! # Usage
//!
//! ```toml
//! # vibebus.toml
//! [[cluster]]
//! enabled = true
//! gossip_addr = "0.0.0.0:7946"
//! peer_addr = "0.0.0.0:7947"
//! seeds = ["node1:7946", "node2:7946"]
//! subscription_sync_timeout = "5s"
//! ```

mod loopback;
mod manager;
mod peer;
mod protocol;

pub use loopback::{LoopbackCluster, LoopbackTransport};
pub use manager::ClusterManager;
pub use peer::ClusterPeer;
pub use protocol::{ClusterMessage, CLUSTER_PROTOCOL_VERSION};

// Re-export cluster config
pub use crate::config::ClusterConfig;
