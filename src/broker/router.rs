//! Message Router
//!
//! Seams between the dispatcher and the session layer: handing prepared
//! copies to client queues, and hearing once per dispatch that it finished.

use std::fmt;

use crate::protocol::{ClientId, Message};
use crate::topic::Subscriber;

/// Per-recipient delivery failure; logged and skipped by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The client disconnected or its session expired
    ClientGone(ClientId),
    /// The client's outbound queue is full
    QueueFull(ClientId),
}

impl DeliveryError {
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::ClientGone(_) => "client_gone",
            DeliveryError::QueueFull(_) => "queue_full",
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::ClientGone(client) => write!(f, "client '{}' is gone", client),
            DeliveryError::QueueFull(client) => {
                write!(f, "outbound queue of client '{}' is full", client)
            }
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Hands a prepared per-recipient message to the client's transport
pub trait MessageRouter: Send + Sync {
    fn route_message_to_client(
        &self,
        message: Message,
        subscriber: &Subscriber,
    ) -> Result<(), DeliveryError>;
}

/// Facts about the dispatch that produced a notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchContext {
    /// The message arrived from another cluster node
    pub from_peer: bool,
}

/// Notified exactly once per dispatch, after every recipient was tried
pub trait RoutedListener: Send + Sync {
    fn message_routed(&self, message: &Message, delivered: usize, context: DispatchContext);
}
