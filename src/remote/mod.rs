//! Remote Node Communication
//!
//! Shared abstractions for clustering: the operations nodes exchange, the
//! transport they travel over, and the per-destination mirror of what the
//! other nodes are subscribed to.

mod message;
mod peer;
mod table;

pub use message::{ClusterOperation, PeerMessage};
pub use peer::{ClusterEvent, ClusterEventCallback, ClusterTransport, RemoteError, RemotePeerStatus};
pub use table::{PeerSyncState, RemoteSubscriptionTable};
