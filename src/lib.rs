//! VibeBus - Clustered publish/subscribe message service
//!
//! Clients subscribe to destinations with optional hierarchical subtopics
//! and header selectors; published messages fan out to matching local
//! subscribers and, depending on each destination's routing mode, to the
//! other nodes of the cluster.

pub mod adapter;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod remote;
pub mod selector;
pub mod session;
pub mod throttle;
pub mod topic;

pub use adapter::{InMemoryAdapter, ServiceAdapter};
pub use broker::{Destination, MessageService, RoutingMode, SyncPolicy};
pub use cluster::{ClusterConfig, ClusterManager, LoopbackCluster};
pub use config::{Config, DestinationConfig, ServiceConfig};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::{ClientId, CommandMessage, CommandReply, Message, MessagingError};
pub use remote::{ClusterEvent, ClusterOperation, ClusterTransport, RemoteError};
pub use topic::{SubscriptionTable, Subtopic};
