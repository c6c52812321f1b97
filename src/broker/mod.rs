//! Message Broker Core
//!
//! The message service owns the destinations, services client commands and
//! published messages, fans messages out to local subscribers and keeps the
//! subscription interest of other cluster nodes in sync.

mod destination;
mod guard;
mod replication;
mod router;
mod service;

pub use destination::{Destination, RoutingMode};
pub use guard::{ConcurrentMutationGuard, ExclusiveSnapshotGuard, SharedExclusiveLock};
pub use router::{DeliveryError, DispatchContext, MessageRouter, RoutedListener};
pub use service::{MessageService, SyncPolicy};
