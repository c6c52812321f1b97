//! Cluster Operations
//!
//! Operations exchanged between nodes to replicate subscription interest and
//! to forward published messages.

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::protocol::{ClientId, Headers, Message};
use crate::topic::SubscriptionSnapshot;

/// A published message as carried between nodes
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PeerMessage {
    pub client_id: Option<String>,
    pub destination: String,
    pub message_id: String,
    pub timestamp: u64,
    pub time_to_live: u64,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl From<&Message> for PeerMessage {
    fn from(message: &Message) -> Self {
        Self {
            client_id: message.client_id.as_deref().map(str::to_string),
            destination: message.destination.clone(),
            message_id: message.message_id.clone(),
            timestamp: message.timestamp,
            time_to_live: message.time_to_live,
            body: message.body.to_vec(),
            headers: message.headers.clone(),
        }
    }
}

impl From<PeerMessage> for Message {
    fn from(message: PeerMessage) -> Self {
        Self {
            client_id: message.client_id.map(ClientId::from),
            destination: message.destination,
            message_id: message.message_id,
            timestamp: message.timestamp,
            time_to_live: message.time_to_live,
            body: Bytes::from(message.body),
            headers: message.headers,
        }
    }
}

/// Operation invoked on a peer's message service
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum ClusterOperation {
    /// Ask the receiver to send its subscription state for a destination
    SendSubscriptions { destination: String },

    /// Full subscription state of the sender for a destination
    ReceiveSubscriptions {
        destination: String,
        snapshot: SubscriptionSnapshot,
    },

    /// The sender's aggregate interest in a (subtopic, selector) pair changed
    SubscribeFromPeer {
        destination: String,
        subscribe: bool,
        selector: Option<String>,
        subtopic: Option<String>,
        sender: String,
    },

    /// A message broadcast to every member
    PushMessageFromPeer {
        message: PeerMessage,
        eval_selector: bool,
    },

    /// A message sent to one member holding matching interest
    PushMessageFromPeerToPeer {
        message: PeerMessage,
        eval_selector: bool,
        sender: String,
    },
}

impl ClusterOperation {
    /// Operation name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ClusterOperation::SendSubscriptions { .. } => "sendSubscriptions",
            ClusterOperation::ReceiveSubscriptions { .. } => "receiveSubscriptions",
            ClusterOperation::SubscribeFromPeer { .. } => "subscribeFromPeer",
            ClusterOperation::PushMessageFromPeer { .. } => "pushMessageFromPeer",
            ClusterOperation::PushMessageFromPeerToPeer { .. } => "pushMessageFromPeerToPeer",
        }
    }

    /// Destination the operation applies to
    pub fn destination(&self) -> &str {
        match self {
            ClusterOperation::SendSubscriptions { destination }
            | ClusterOperation::ReceiveSubscriptions { destination, .. }
            | ClusterOperation::SubscribeFromPeer { destination, .. } => destination,
            ClusterOperation::PushMessageFromPeer { message, .. }
            | ClusterOperation::PushMessageFromPeerToPeer { message, .. } => &message.destination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SUBTOPIC_HEADER;

    #[test]
    fn test_peer_message_keeps_headers_and_body() {
        let message = Message::new("feed", "hello")
            .with_client_id("c1")
            .with_subtopic("news.sports")
            .with_header("n", 3i64);

        let back: Message = PeerMessage::from(&message).into();
        assert_eq!(back, message);
        assert_eq!(
            back.header(SUBTOPIC_HEADER).and_then(|v| v.as_str()),
            Some("news.sports")
        );
    }

    #[test]
    fn test_operation_destination() {
        let op = ClusterOperation::PushMessageFromPeer {
            message: PeerMessage::from(&Message::new("feed", "x")),
            eval_selector: true,
        };
        assert_eq!(op.destination(), "feed");
        assert_eq!(op.name(), "pushMessageFromPeer");
    }
}
