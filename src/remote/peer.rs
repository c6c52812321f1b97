//! Cluster Transport Abstraction
//!
//! The message service talks to other nodes only through `ClusterTransport`,
//! implemented by the gossip/TCP cluster manager and by the in-process
//! loopback cluster.

use std::fmt;
use std::sync::Arc;

use crate::protocol::ClientId;

use super::message::ClusterOperation;

/// Failure to hand an operation to another node
#[derive(Debug)]
pub enum RemoteError {
    /// The link to the peer is down or closed
    ConnectionLost(String),
    /// The peer refused the link or sent something it should not have
    Rejected(String),
    Timeout,
    /// The peer's outbound queue is at capacity
    QueueFull,
    /// No live member with this address
    UnknownPeer(String),
    Other(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            RemoteError::Rejected(msg) => write!(f, "rejected: {}", msg),
            RemoteError::Timeout => write!(f, "timed out"),
            RemoteError::QueueFull => write!(f, "peer queue full"),
            RemoteError::UnknownPeer(node) => write!(f, "unknown peer '{}'", node),
            RemoteError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

/// State of an outbound peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePeerStatus {
    Disconnected,
    Connecting,
    /// Handshake done, operations flow
    Connected,
    /// Waiting before the next connect attempt
    Backoff,
    /// The peer refused us; no further attempts
    Failed,
}

/// Membership change or inbound operation delivered by a transport
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A node became reachable (first seen, or restarted)
    MemberJoined(ClientId),
    /// A node left or was declared dead
    MemberLeft(ClientId),
    /// An operation sent by another node
    Operation {
        from: ClientId,
        operation: ClusterOperation,
    },
}

/// Callback a transport invokes for each event, in per-peer FIFO order
pub type ClusterEventCallback = Arc<dyn Fn(ClusterEvent) + Send + Sync>;

/// Ordered, non-blocking delivery of operations to cluster members
///
/// Implementations only enqueue; they never block on network I/O, so the
/// service may call them while holding its subscription guard. Operations
/// sent from one node to another arrive in the order they were sent.
pub trait ClusterTransport: Send + Sync {
    /// Address of this node as seen by the others
    fn local_address(&self) -> ClientId;

    /// Addresses of the other live members
    fn member_addresses(&self) -> Vec<ClientId>;

    /// Send to every other member
    fn broadcast(&self, operation: ClusterOperation) -> Result<(), RemoteError>;

    /// Send to one member
    fn send_to(&self, member: &ClientId, operation: ClusterOperation) -> Result<(), RemoteError>;
}
