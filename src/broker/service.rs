//! Message Service
//!
//! Entry point for everything a destination does: published messages,
//! subscription commands, local fan-out and the cluster operations other
//! nodes invoke.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::adapter::ServiceAdapter;
use crate::config::{DestinationConfig, ServiceConfig};
use crate::metrics::Metrics;
use crate::protocol::{
    ClientId, Command, CommandMessage, CommandReply, Message, MessagingError, MultiSubscribeEntry,
    RawCommand, ENDPOINT_HEADER, PRIORITY_HEADER, SENDER_CLIENT_ID_HEADER,
};
use crate::remote::{ClusterOperation, ClusterTransport, PeerMessage};
use crate::selector::{HeaderSelectorFactory, SelectorFactory};
use crate::session::OutboxRegistry;
use crate::throttle::ThrottleDecision;
use crate::topic::{SubscriptionCriteria, SubtopicError};

use super::destination::{Destination, RoutingMode};
use super::guard::SharedExclusiveLock;
use super::router::{DispatchContext, MessageRouter, RoutedListener};

/// How long `start` waits for each peer's subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub timeout: Duration,
    /// Extra requests after the first one times out
    pub retries: u32,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 1,
        }
    }
}

/// Publish/subscribe service over a set of destinations
pub struct MessageService {
    id: String,
    default_separator: String,
    destinations: DashMap<String, Arc<Destination>>,
    selectors: Arc<dyn SelectorFactory>,
    /// Mutations share it; subscription snapshots for peers take it alone
    pub(super) guard: SharedExclusiveLock,
    outboxes: Arc<OutboxRegistry>,
    router: RwLock<Arc<dyn MessageRouter>>,
    listeners: RwLock<Vec<Arc<dyn RoutedListener>>>,
    pub(super) cluster: RwLock<Option<Arc<dyn ClusterTransport>>>,
    pub(super) sync_policy: RwLock<SyncPolicy>,
    pub(super) started: AtomicBool,
    pub(super) metrics: Option<Arc<Metrics>>,
}

impl MessageService {
    pub fn new(config: &ServiceConfig) -> Self {
        Self::with_selectors(config, Arc::new(HeaderSelectorFactory))
    }

    /// Create a service with a custom selector grammar
    pub fn with_selectors(config: &ServiceConfig, selectors: Arc<dyn SelectorFactory>) -> Self {
        let outboxes = Arc::new(OutboxRegistry::new(config.outbound_queue_capacity));
        let router: Arc<dyn MessageRouter> = outboxes.clone();
        Self {
            id: config.id.clone(),
            default_separator: config.subtopic_separator.clone(),
            destinations: DashMap::new(),
            selectors,
            guard: SharedExclusiveLock::new(),
            router: RwLock::new(router),
            outboxes,
            listeners: RwLock::new(Vec::new()),
            cluster: RwLock::new(None),
            sync_policy: RwLock::new(SyncPolicy::default()),
            started: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a destination, replacing any with the same id
    pub fn add_destination(
        &self,
        config: DestinationConfig,
        adapter: Arc<dyn ServiceAdapter>,
    ) -> Result<Arc<Destination>, SubtopicError> {
        let destination = Arc::new(Destination::new(
            config,
            &self.default_separator,
            self.selectors.clone(),
            adapter,
        )?);
        let id = destination.id().to_string();
        if self
            .destinations
            .insert(id.clone(), destination.clone())
            .is_some()
        {
            warn!("Service '{}': replaced destination '{}'", self.id, id);
        }
        debug!(
            "Service '{}': destination '{}' ({:?}, clustered: {}, adapter: {})",
            self.id,
            id,
            destination.routing_mode(),
            destination.is_clustered(),
            destination.adapter().name()
        );
        Ok(destination)
    }

    pub fn destination(&self, id: &str) -> Option<Arc<Destination>> {
        self.destinations.get(id).map(|d| d.value().clone())
    }

    pub(super) fn require_destination(&self, id: &str) -> Result<Arc<Destination>, MessagingError> {
        self.destination(id)
            .ok_or_else(|| MessagingError::UnknownDestination(id.to_string()))
    }

    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        let mut out: Vec<_> = self.destinations.iter().map(|d| d.value().clone()).collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    pub fn outboxes(&self) -> &Arc<OutboxRegistry> {
        &self.outboxes
    }

    /// Replace the default outbox router
    pub fn set_router(&self, router: Arc<dyn MessageRouter>) {
        *self.router.write() = router;
    }

    pub fn add_routed_listener(&self, listener: Arc<dyn RoutedListener>) {
        self.listeners.write().push(listener);
    }

    /// Attach the transport used to reach other cluster nodes
    pub fn attach_cluster(&self, transport: Arc<dyn ClusterTransport>, policy: SyncPolicy) {
        *self.cluster.write() = Some(transport);
        *self.sync_policy.write() = policy;
    }

    pub(super) fn cluster(&self) -> Option<Arc<dyn ClusterTransport>> {
        self.cluster.read().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    // Published messages

    /// Accept a message published by a client
    pub fn service_message(&self, mut message: Message) -> Result<(), MessagingError> {
        let destination = self.require_destination(&message.destination)?;
        if let Some(ref metrics) = self.metrics {
            metrics.message_received();
        }

        destination.check_publish(&message)?;
        if let Some(ttl) = destination.config().message_ttl {
            message.time_to_live = ttl.as_millis() as u64;
        }

        match destination.throttle().throttle_incoming(&message) {
            ThrottleDecision::Allow => {}
            ThrottleDecision::Ignore => {
                if let Some(ref metrics) = self.metrics {
                    metrics.message_throttled("inbound");
                }
                return Ok(());
            }
            ThrottleDecision::Reject => {
                if let Some(ref metrics) = self.metrics {
                    metrics.message_throttled("inbound");
                }
                return Err(MessagingError::Throttled(destination.id().to_string()));
            }
        }

        destination.adapter().clone().invoke(self, message)
    }

    /// Accept a message produced by an adapter
    ///
    /// With `send_to_all` the message reaches every matching subscriber here
    /// and on other nodes, without selector evaluation; otherwise only the
    /// client named by `message.client_id`.
    pub fn service_message_from_adapter(
        &self,
        message: Message,
        send_to_all: bool,
    ) -> Result<(), MessagingError> {
        let destination = self.require_destination(&message.destination)?;
        if send_to_all {
            self.push_message_to_clients(&message, false)?;
            return self.send_push_message_from_peer(&message, false);
        }

        match message.client_id.clone() {
            Some(client_id) => {
                let recipients = BTreeSet::from([client_id]);
                self.dispatch(&destination, &message, &recipients, false, DispatchContext::default());
            }
            None => debug!(
                "Destination '{}': adapter message without a recipient dropped",
                destination.id()
            ),
        }
        Ok(())
    }

    /// Deliver to every matching local subscriber
    pub fn push_message_to_clients(
        &self,
        message: &Message,
        eval_selector: bool,
    ) -> Result<usize, MessagingError> {
        let destination = self.require_destination(&message.destination)?;
        let recipients = destination
            .subscriptions()
            .get_subscriber_ids(message, eval_selector);
        Ok(self.dispatch(&destination, message, &recipients, false, DispatchContext::default()))
    }

    /// Deliver to a precomputed set of subscribers
    ///
    /// With `eval_selector` each recipient's own subscriptions are tested
    /// again and non-matching recipients are skipped.
    pub fn push_message_to_clients_with_ids(
        &self,
        message: &Message,
        subscriber_ids: &BTreeSet<ClientId>,
        eval_selector: bool,
    ) -> Result<usize, MessagingError> {
        let destination = self.require_destination(&message.destination)?;
        Ok(self.dispatch(
            &destination,
            message,
            subscriber_ids,
            eval_selector,
            DispatchContext::default(),
        ))
    }

    /// Fan a message out to local recipients; returns the delivered count
    ///
    /// Per-recipient failures are logged and skipped. Listeners hear about
    /// the dispatch exactly once, also when nothing was delivered.
    pub(super) fn dispatch(
        &self,
        destination: &Destination,
        message: &Message,
        recipients: &BTreeSet<ClientId>,
        recheck: bool,
        context: DispatchContext,
    ) -> usize {
        let started = Instant::now();
        let throttle = destination.throttle();

        let mut delivered = 0;
        if !recipients.is_empty() && throttle.throttle_outgoing(started) {
            if let Some(ref metrics) = self.metrics {
                metrics.message_throttled("outbound");
            }
        } else if !recipients.is_empty() {
            let mut template = message.clone();
            template.remove_header(SENDER_CLIENT_ID_HEADER);
            template.remove_header(ENDPOINT_HEADER);
            if template.priority().is_none() {
                if let Some(priority) = destination.priority() {
                    template.set_header(PRIORITY_HEADER, priority as i64);
                }
            }

            let router = self.router.read().clone();
            for client_id in recipients {
                let Some(subscriber) = destination.subscriptions().subscriber(client_id) else {
                    debug!(
                        "Destination '{}': subscriber '{}' left before delivery",
                        destination.id(),
                        client_id
                    );
                    continue;
                };
                if !subscriber.is_valid() {
                    continue;
                }
                if recheck && !subscriber.test_message(message) {
                    continue;
                }
                if throttle.throttle_outgoing_client(client_id, subscriber.max_frequency(), started)
                {
                    if let Some(ref metrics) = self.metrics {
                        metrics.message_throttled("outbound_client");
                    }
                    continue;
                }

                let mut copy = template.clone();
                copy.client_id = Some(client_id.clone());
                match router.route_message_to_client(copy, &subscriber) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        debug!("Destination '{}': skipping delivery: {}", destination.id(), e);
                        if let Some(ref metrics) = self.metrics {
                            metrics.delivery_failed(e.reason());
                        }
                    }
                }
            }
        }

        if let Some(ref metrics) = self.metrics {
            metrics.messages_delivered(delivered);
            metrics
                .dispatch_latency
                .observe(started.elapsed().as_secs_f64());
        }

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.message_routed(message, delivered, context);
        }
        delivered
    }

    /// Forward a locally published message to other nodes per routing mode
    pub fn send_push_message_from_peer(
        &self,
        message: &Message,
        eval_selector: bool,
    ) -> Result<(), MessagingError> {
        let destination = self.require_destination(&message.destination)?;
        if !destination.is_clustered() {
            return Ok(());
        }
        let Some(transport) = self.cluster() else {
            return Ok(());
        };

        match destination.routing_mode() {
            RoutingMode::None => {}
            RoutingMode::Broadcast => {
                let operation = ClusterOperation::PushMessageFromPeer {
                    message: PeerMessage::from(message),
                    eval_selector,
                };
                self.record_sent(&operation);
                if let Err(e) = transport.broadcast(operation) {
                    warn!("Destination '{}': broadcast failed: {}", destination.id(), e);
                }
            }
            RoutingMode::ServerToServer => {
                let peers = destination
                    .remote_subscriptions()
                    .matching_peers(message, eval_selector);
                if peers.is_empty() {
                    return Ok(());
                }
                let wire = PeerMessage::from(message);
                let sender = transport.local_address().to_string();
                for peer in peers {
                    let operation = ClusterOperation::PushMessageFromPeerToPeer {
                        message: wire.clone(),
                        eval_selector,
                        sender: sender.clone(),
                    };
                    self.record_sent(&operation);
                    if let Err(e) = transport.send_to(&peer, operation) {
                        warn!(
                            "Destination '{}': push to '{}' failed: {}",
                            destination.id(),
                            peer,
                            e
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub(super) fn record_sent(&self, operation: &ClusterOperation) {
        if let Some(ref metrics) = self.metrics {
            metrics.cluster_operation_sent(operation.name());
        }
    }

    // Commands

    /// Decode and service a command as delivered by an endpoint
    pub fn service_raw_command(&self, raw: RawCommand) -> Result<CommandReply, MessagingError> {
        self.service_command(CommandMessage::try_from(raw)?)
    }

    /// Service a subscription command
    pub fn service_command(&self, command: CommandMessage) -> Result<CommandReply, MessagingError> {
        if command.command == Command::Disconnect {
            self.disconnect_client(&command.client_id);
            return Ok(CommandReply::Acknowledged);
        }

        let destination = self.require_destination(&command.destination)?;
        let adapter = destination.adapter().clone();
        let managed = adapter.handles_subscriptions();

        // Rejected entries never reach the adapter
        match command.command {
            Command::Subscribe {
                ref subtopic,
                ref selector,
                ..
            } => {
                self.check_subscription(
                    &destination,
                    subtopic.as_deref(),
                    selector.as_deref(),
                    !managed,
                )?;
            }
            Command::MultiSubscribe { ref add, .. } => {
                for entry in add {
                    self.check_subscription(
                        &destination,
                        entry.subtopic.as_deref(),
                        entry.selector.as_deref(),
                        !managed,
                    )?;
                }
            }
            _ => {}
        }

        let adapter_reply = if managed {
            adapter.manage(&command)?
        } else {
            None
        };

        let client_id = &command.client_id;
        let endpoint = command.endpoint_id.as_str();
        match command.command {
            Command::Subscribe {
                ref subtopic,
                ref selector,
                max_frequency,
            } => {
                let entry = MultiSubscribeEntry {
                    subtopic: subtopic.clone(),
                    selector: selector.clone(),
                    max_frequency,
                };
                self.subscribe(&destination, client_id, &entry, endpoint);
            }
            Command::Unsubscribe {
                ref subtopic,
                ref selector,
            } => {
                self.unsubscribe(
                    &destination,
                    client_id,
                    subtopic.as_deref(),
                    selector.as_deref(),
                );
            }
            Command::MultiSubscribe { ref add, ref remove } => {
                for entry in add {
                    self.subscribe(&destination, client_id, entry, endpoint);
                }
                for entry in remove {
                    self.unsubscribe(
                        &destination,
                        client_id,
                        entry.subtopic.as_deref(),
                        entry.selector.as_deref(),
                    );
                }
            }
            Command::Poll => return self.poll(&destination, client_id, adapter_reply, managed),
            Command::Disconnect => {}
        }

        Ok(adapter_reply.unwrap_or(CommandReply::Acknowledged))
    }

    fn check_subscription(
        &self,
        destination: &Destination,
        subtopic: Option<&str>,
        selector: Option<&str>,
        validate_selector: bool,
    ) -> Result<(), MessagingError> {
        destination.check_subscription_subtopic(subtopic)?;
        if let (Some(expression), true) = (selector, validate_selector) {
            self.selectors.compile(expression)?;
        }
        Ok(())
    }

    fn subscribe(
        &self,
        destination: &Destination,
        client_id: &ClientId,
        entry: &MultiSubscribeEntry,
        endpoint_id: &str,
    ) {
        self.outboxes.register(client_id);
        let criteria = SubscriptionCriteria::new(entry.subtopic.as_deref(), entry.selector.as_deref());
        let table = destination.subscriptions();

        let _guard = self.guard.acquire_for_concurrent_mutation();
        let existed = {
            let _interest = destination.lock_interest();
            let existed = table
                .subscriber(client_id)
                .is_some_and(|s| s.has_subscription(&criteria));
            let first = table.add_subscriber(
                client_id,
                criteria.selector.as_deref(),
                criteria.subtopic.as_deref(),
                endpoint_id,
                entry.max_frequency,
            );
            if first {
                self.send_subscribe_from_peer(destination, true, &criteria);
            }
            existed
        };
        // A concurrent last unsubscribe elsewhere may have dropped the outbox
        // between the first register and the add
        self.outboxes.register(client_id);

        if !existed {
            if let Some(ref metrics) = self.metrics {
                metrics.subscription_added();
            }
        }
    }

    fn unsubscribe(
        &self,
        destination: &Destination,
        client_id: &ClientId,
        subtopic: Option<&str>,
        selector: Option<&str>,
    ) {
        let criteria = SubscriptionCriteria::new(subtopic, selector);
        let table = destination.subscriptions();

        let _guard = self.guard.acquire_for_concurrent_mutation();
        {
            let _interest = destination.lock_interest();
            let held = table
                .subscriber(client_id)
                .is_some_and(|s| s.has_subscription(&criteria));
            if !held {
                return;
            }
            let last = table.remove_subscriber(
                client_id,
                criteria.selector.as_deref(),
                criteria.subtopic.as_deref(),
            );
            if last {
                self.send_subscribe_from_peer(destination, false, &criteria);
            }
        }
        if table.subscriber(client_id).is_none() {
            destination.throttle().forget_client(client_id);
            self.release_outbox_if_idle(client_id);
        }
        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_removed(1);
        }
    }

    fn holds_subscriptions(&self, client_id: &ClientId) -> bool {
        self.destinations
            .iter()
            .any(|d| d.value().subscriptions().subscriber(client_id).is_some())
    }

    /// Drop the client's outbox once it holds no subscription anywhere
    fn release_outbox_if_idle(&self, client_id: &ClientId) {
        let released = self
            .outboxes
            .unregister_if(client_id, || !self.holds_subscriptions(client_id));
        if let Some(pending) = released {
            debug!(
                "Service '{}': client '{}' has no subscriptions left, {} queued messages dropped",
                self.id,
                client_id,
                pending.len()
            );
        }
    }

    fn poll(
        &self,
        destination: &Destination,
        client_id: &ClientId,
        adapter_reply: Option<CommandReply>,
        managed: bool,
    ) -> Result<CommandReply, MessagingError> {
        if let Some(CommandReply::Messages(messages)) = adapter_reply {
            let recipients = BTreeSet::from([client_id.clone()]);
            for message in messages {
                self.dispatch(destination, &message, &recipients, false, DispatchContext::default());
            }
        }

        if !managed && destination.subscriptions().subscriber(client_id).is_none() {
            return Err(MessagingError::NotSubscribed(destination.id().to_string()));
        }
        let mut messages = self.outboxes.drain(client_id).unwrap_or_default();
        let queued = messages.len();
        messages.retain(|m| !m.is_expired());
        if messages.len() < queued {
            debug!(
                "Destination '{}': {} expired messages for '{}' discarded",
                destination.id(),
                queued - messages.len(),
                client_id
            );
        }
        Ok(CommandReply::Messages(messages))
    }

    /// Drop every subscription a client holds on every destination
    pub fn disconnect_client(&self, client_id: &ClientId) {
        let mut removed = 0;
        for destination in self.destinations() {
            let table = destination.subscriptions();
            let _guard = self.guard.acquire_for_concurrent_mutation();
            let _interest = destination.lock_interest();
            let held = table
                .subscriber(client_id)
                .map(|s| s.subscription_count())
                .unwrap_or(0);
            for criteria in table.remove_client(client_id) {
                self.send_subscribe_from_peer(&destination, false, &criteria);
            }
            destination.throttle().forget_client(client_id);
            removed += held;
        }
        self.outboxes.unregister(client_id);

        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_removed(removed);
        }
        debug!(
            "Service '{}': client '{}' disconnected, {} subscriptions dropped",
            self.id, client_id, removed
        );
    }

    /// Tell other nodes this node's interest in a criteria changed
    ///
    /// Called under the mutation guard so the change is ordered against
    /// any subscription snapshot sent to the same peer.
    fn send_subscribe_from_peer(
        &self,
        destination: &Destination,
        subscribe: bool,
        criteria: &SubscriptionCriteria,
    ) {
        if !destination.is_server_to_server() {
            return;
        }
        let Some(transport) = self.cluster() else {
            return;
        };
        let operation = ClusterOperation::SubscribeFromPeer {
            destination: destination.id().to_string(),
            subscribe,
            selector: criteria.selector.clone(),
            subtopic: criteria.subtopic.clone(),
            sender: transport.local_address().to_string(),
        };
        self.record_sent(&operation);
        if let Err(e) = transport.broadcast(operation) {
            warn!(
                "Destination '{}': subscription update not sent: {}",
                destination.id(),
                e
            );
        }
    }

    // Lifecycle

    /// Start the service
    ///
    /// For every clustered server-to-server destination, asks each known
    /// member for its subscriptions and waits for the replies within the
    /// configured sync policy. Peers that stay silent are logged and
    /// skipped; their state is still installed whenever it arrives.
    pub async fn start(&self) {
        self.started.store(true, Ordering::Release);

        let Some(transport) = self.cluster() else {
            info!("Service '{}' started", self.id);
            return;
        };
        let policy = *self.sync_policy.read();
        let members = transport.member_addresses();
        let destinations: Vec<_> = self
            .destinations()
            .into_iter()
            .filter(|d| d.is_server_to_server())
            .collect();

        for destination in &destinations {
            for member in &members {
                self.request_subscriptions(destination, member);
            }
        }

        for destination in &destinations {
            for member in &members {
                let remote = destination.remote_subscriptions();
                let mut attempt = 0;
                while !remote.wait_synchronized(member, policy.timeout).await {
                    if attempt >= policy.retries {
                        warn!(
                            "Destination '{}': no subscription state from '{}' after {} attempts, continuing",
                            destination.id(),
                            member,
                            attempt + 1
                        );
                        break;
                    }
                    attempt += 1;
                    debug!(
                        "Destination '{}': asking '{}' again for subscriptions",
                        destination.id(),
                        member
                    );
                    self.request_subscriptions(destination, member);
                }
            }
        }

        info!(
            "Service '{}' started with {} cluster members",
            self.id,
            members.len()
        );
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        info!("Service '{}' stopped", self.id);
    }
}
