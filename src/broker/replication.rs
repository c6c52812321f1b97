//! Cluster Replication
//!
//! Handlers for the operations other nodes invoke on this service, and the
//! subscription state handshake with them.
//!
//! Per destination, a node's interest reaches a peer as one full snapshot
//! followed by incremental updates over the same ordered link. The snapshot
//! is taken and enqueued under the exclusive guard while updates are
//! enqueued under the mutation guard, so no update can fall between the
//! table state a snapshot captured and its place on the link.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::protocol::{ClientId, Message};
use crate::remote::{ClusterEvent, ClusterOperation};
use crate::topic::SubscriptionSnapshot;

use super::destination::Destination;
use super::router::DispatchContext;
use super::service::MessageService;

impl MessageService {
    /// Handle an event delivered by the cluster transport
    ///
    /// Never panics or returns errors: a bad operation from a peer is
    /// logged and dropped.
    pub fn handle_cluster_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::MemberJoined(member) => self.member_joined(&member),
            ClusterEvent::MemberLeft(member) => self.member_left(&member),
            ClusterEvent::Operation { from, operation } => {
                if let Some(ref metrics) = self.metrics {
                    metrics.cluster_operation_received(operation.name());
                }
                self.handle_operation(&from, operation);
            }
        }
    }

    fn handle_operation(&self, from: &ClientId, operation: ClusterOperation) {
        match operation {
            ClusterOperation::SendSubscriptions { destination } => {
                self.send_subscriptions(&destination, from);
            }
            ClusterOperation::ReceiveSubscriptions {
                destination,
                snapshot,
            } => {
                self.receive_subscriptions(&destination, &snapshot, from);
            }
            ClusterOperation::SubscribeFromPeer {
                destination,
                subscribe,
                selector,
                subtopic,
                sender,
            } => {
                let sender = ClientId::from(sender);
                if sender != *from {
                    debug!("Subscription update relayed by '{}' for '{}'", from, sender);
                }
                self.subscribe_from_peer(
                    &destination,
                    subscribe,
                    selector.as_deref(),
                    subtopic.as_deref(),
                    &sender,
                );
            }
            ClusterOperation::PushMessageFromPeer {
                message,
                eval_selector,
            } => {
                self.push_message_from_peer(message.into(), eval_selector);
            }
            ClusterOperation::PushMessageFromPeerToPeer {
                message,
                eval_selector,
                sender,
            } => {
                self.push_message_from_peer_to_peer(
                    message.into(),
                    eval_selector,
                    &ClientId::from(sender),
                );
            }
        }
    }

    fn member_joined(&self, member: &ClientId) {
        if let Some(ref metrics) = self.metrics {
            metrics.cluster_peer_connected();
        }
        // Members known at start are handled by `start` itself
        if !self.is_started() {
            return;
        }
        debug!("Service '{}': member '{}' joined", self.id(), member);
        for destination in self.destinations() {
            if destination.is_server_to_server() {
                self.request_subscriptions(&destination, member);
            }
        }
    }

    fn member_left(&self, member: &ClientId) {
        if let Some(ref metrics) = self.metrics {
            metrics.cluster_peer_disconnected();
        }
        debug!("Service '{}': member '{}' left", self.id(), member);
        for destination in self.destinations() {
            destination.remote_subscriptions().remove_peer(member);
        }
    }

    /// Clustered destination an operation from a peer refers to
    ///
    /// A missing or non-clustered destination means the nodes are configured
    /// differently; the operation cannot be applied.
    fn clustered_destination(
        &self,
        id: &str,
        peer: &str,
        operation: &str,
    ) -> Option<Arc<Destination>> {
        match self.destination(id) {
            Some(destination) if destination.is_clustered() => Some(destination),
            Some(_) => {
                error!(
                    "Destination '{}' is not clustered here, dropping {} from '{}'",
                    id, operation, peer
                );
                None
            }
            None => {
                error!(
                    "Destination '{}' does not exist here, dropping {} from '{}'",
                    id, operation, peer
                );
                None
            }
        }
    }

    /// Ask a peer for its subscription state on a destination
    pub fn request_subscriptions(&self, destination: &Destination, peer: &ClientId) {
        let Some(transport) = self.cluster() else {
            return;
        };
        destination.remote_subscriptions().mark_requested(peer);

        let operation = ClusterOperation::SendSubscriptions {
            destination: destination.id().to_string(),
        };
        self.record_sent(&operation);
        debug!(
            "Destination '{}': requesting subscriptions from '{}'",
            destination.id(),
            peer
        );
        if let Err(e) = transport.send_to(peer, operation) {
            warn!(
                "Destination '{}': subscription request to '{}' failed: {}",
                destination.id(),
                peer,
                e
            );
        }
    }

    /// Answer a peer's request with a full snapshot of local interest
    pub fn send_subscriptions(&self, destination: &str, requester: &ClientId) {
        let Some(destination) = self.clustered_destination(destination, requester, "sendSubscriptions")
        else {
            return;
        };
        let Some(transport) = self.cluster() else {
            return;
        };

        // Accept the requester's updates from now on, ahead of its own state
        destination.remote_subscriptions().seed(requester);

        let _guard = self.guard.acquire_for_exclusive_snapshot();
        let snapshot = destination.subscriptions().subscription_state();
        debug!(
            "Destination '{}': sending {} subscriptions to '{}'",
            destination.id(),
            snapshot.len(),
            requester
        );
        let operation = ClusterOperation::ReceiveSubscriptions {
            destination: destination.id().to_string(),
            snapshot,
        };
        self.record_sent(&operation);
        if let Err(e) = transport.send_to(requester, operation) {
            warn!(
                "Destination '{}': subscription state for '{}' not sent: {}",
                destination.id(),
                requester,
                e
            );
        }
    }

    /// Install a peer's full subscription state
    pub fn receive_subscriptions(
        &self,
        destination: &str,
        snapshot: &SubscriptionSnapshot,
        sender: &ClientId,
    ) {
        let Some(destination) = self.clustered_destination(destination, sender, "receiveSubscriptions")
        else {
            return;
        };
        destination.remote_subscriptions().install(sender, snapshot);
    }

    /// Apply one interest change reported by a peer
    pub fn subscribe_from_peer(
        &self,
        destination: &str,
        subscribe: bool,
        selector: Option<&str>,
        subtopic: Option<&str>,
        sender: &ClientId,
    ) {
        let Some(destination) = self.clustered_destination(destination, sender, "subscribeFromPeer")
        else {
            return;
        };
        destination
            .remote_subscriptions()
            .apply(sender, subscribe, selector, subtopic);
    }

    /// Deliver a message broadcast by a peer to local subscribers
    ///
    /// Selectors are always evaluated here, so a message that reached this
    /// node only because of broadcast routing is filtered out locally.
    pub fn push_message_from_peer(&self, message: Message, _eval_selector: bool) -> usize {
        self.redeliver_from_peer(message, "a broadcasting peer")
    }

    /// Deliver a message a peer sent to this node specifically
    pub fn push_message_from_peer_to_peer(
        &self,
        message: Message,
        _eval_selector: bool,
        sender: &ClientId,
    ) -> usize {
        self.redeliver_from_peer(message, sender)
    }

    fn redeliver_from_peer(&self, message: Message, origin: &str) -> usize {
        if !self.started.load(Ordering::Acquire) {
            debug!(
                "Service '{}' not started, ignoring message for '{}' from {}",
                self.id(),
                message.destination,
                origin
            );
            return 0;
        }
        let Some(destination) =
            self.clustered_destination(&message.destination, origin, "pushMessageFromPeer")
        else {
            return 0;
        };

        let recipients = destination.subscriptions().get_subscriber_ids(&message, true);
        let delivered = self.dispatch(
            &destination,
            &message,
            &recipients,
            false,
            DispatchContext { from_peer: true },
        );
        if let Some(ref metrics) = self.metrics {
            metrics.peer_message_pushed();
        }
        delivered
    }
}
