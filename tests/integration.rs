//! Integration Tests for VibeBus
//!
//! These tests run several message services in one process, joined through
//! the loopback cluster, and verify local delivery, subscription replication
//! between nodes and routing of published messages across the cluster.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rand::Rng;
use test_case::test_case;

use vibebus::broker::{DeliveryError, DispatchContext, MessageRouter, RoutedListener};
use vibebus::cluster::LoopbackCluster;
use vibebus::protocol::{
    Command, ENDPOINT_HEADER, PRIORITY_HEADER, SENDER_CLIENT_ID_HEADER,
};
use vibebus::selector::HeaderSelectorFactory;
use vibebus::topic::{Subscriber, SubscriptionCriteria};
use vibebus::{
    ClientId, CommandMessage, CommandReply, DestinationConfig, InMemoryAdapter, Message,
    MessageService, MessagingError, RoutingMode, ServiceConfig, SubscriptionTable, SyncPolicy,
};

const FEED: &str = "feed";

fn client(id: &str) -> ClientId {
    ClientId::from(id)
}

fn standalone(destination: DestinationConfig) -> Arc<MessageService> {
    let service = Arc::new(MessageService::new(&ServiceConfig::default()));
    service
        .add_destination(destination, Arc::new(InMemoryAdapter))
        .unwrap();
    service
}

/// Create a service and join it to the cluster under `address`
fn node(
    cluster: &Arc<LoopbackCluster>,
    address: &str,
    destination: DestinationConfig,
) -> Arc<MessageService> {
    let config = ServiceConfig {
        id: address.to_string(),
        ..ServiceConfig::default()
    };
    let service = Arc::new(MessageService::new(&config));
    service
        .add_destination(destination, Arc::new(InMemoryAdapter))
        .unwrap();

    let handler = service.clone();
    let transport = cluster.join(
        address,
        Arc::new(move |event| handler.handle_cluster_event(event)),
    );
    service.attach_cluster(
        transport,
        SyncPolicy {
            timeout: Duration::from_secs(2),
            retries: 0,
        },
    );
    service
}

fn subscribe(service: &MessageService, id: &str, subtopic: Option<&str>, selector: Option<&str>) {
    let reply = service
        .service_command(CommandMessage::subscribe(id, FEED, subtopic, selector))
        .unwrap();
    assert_eq!(reply, CommandReply::Acknowledged);
}

fn unsubscribe(service: &MessageService, id: &str, subtopic: Option<&str>, selector: Option<&str>) {
    service
        .service_command(CommandMessage::unsubscribe(id, FEED, subtopic, selector))
        .unwrap();
}

fn poll(service: &MessageService, id: &str) -> Vec<Message> {
    match service.service_command(CommandMessage::new(id, FEED, "", Command::Poll)) {
        Ok(CommandReply::Messages(messages)) => messages,
        Ok(CommandReply::Acknowledged) => panic!("poll must return messages"),
        Err(e) => panic!("poll failed: {}", e),
    }
}

fn publish(service: &MessageService, body: &'static str, subtopic: &str) {
    service
        .service_message(Message::new(FEED, body).with_subtopic(subtopic))
        .unwrap();
}

fn remote_view(service: &MessageService, peer: &str) -> Vec<SubscriptionCriteria> {
    service
        .destination(FEED)
        .unwrap()
        .remote_subscriptions()
        .peer_subscriptions(&client(peer))
}

fn local_state(service: &MessageService) -> Vec<SubscriptionCriteria> {
    service
        .destination(FEED)
        .unwrap()
        .subscriptions()
        .subscription_state()
        .entries
}

/// Records every completed dispatch
#[derive(Default)]
struct DispatchLog {
    calls: Mutex<Vec<(usize, bool)>>,
}

impl RoutedListener for DispatchLog {
    fn message_routed(&self, _message: &Message, delivered: usize, context: DispatchContext) {
        self.calls.lock().push((delivered, context.from_peer));
    }
}

/// Router whose delivery to one client always fails
struct BrokenLink {
    broken: ClientId,
    delivered: Mutex<Vec<ClientId>>,
}

impl MessageRouter for BrokenLink {
    fn route_message_to_client(
        &self,
        message: Message,
        subscriber: &Subscriber,
    ) -> Result<(), DeliveryError> {
        if *subscriber.client_id() == self.broken {
            return Err(DeliveryError::ClientGone(self.broken.clone()));
        }
        if let Some(recipient) = message.client_id {
            self.delivered.lock().push(recipient);
        }
        Ok(())
    }
}

// ============================================================================
// Local delivery
// ============================================================================

#[test]
fn test_subtopic_delivery_end_to_end() {
    let mut config = DestinationConfig::new(FEED);
    config.priority = Some(4);
    let service = standalone(config);
    subscribe(&service, "x", Some("news.*"), None);

    service
        .service_message(
            Message::new(FEED, "hello")
                .with_subtopic("news.sports")
                .with_header(SENDER_CLIENT_ID_HEADER, "publisher")
                .with_header(ENDPOINT_HEADER, "ws"),
        )
        .unwrap();
    let received = poll(&service, "x");
    assert_eq!(received.len(), 1);
    assert_eq!(&received[0].body[..], b"hello");
    assert!(received[0].header(SENDER_CLIENT_ID_HEADER).is_none());
    assert!(received[0].header(ENDPOINT_HEADER).is_none());
    assert_eq!(received[0].priority(), Some(4));

    publish(&service, "rain", "weather.today");
    assert!(poll(&service, "x").is_empty());
}

#[test]
fn test_identical_subscription_added_once() {
    let table = SubscriptionTable::new(FEED, ".", Arc::new(HeaderSelectorFactory));
    let x = client("x");
    assert!(table.add_subscriber(&x, Some("kind = 'a'"), Some("news"), "ep", 0));
    assert!(!table.add_subscriber(&x, Some("kind = 'a'"), Some("news"), "ep", 0));
    assert_eq!(table.client_subscriptions().len(), 1);

    let message = Message::new(FEED, "x")
        .with_subtopic("news")
        .with_header("kind", "a");
    assert_eq!(
        table.get_subscriber_ids(&message, true),
        BTreeSet::from([x])
    );
}

#[test]
fn test_remove_requires_exact_match() {
    let table = SubscriptionTable::new(FEED, ".", Arc::new(HeaderSelectorFactory));
    let x = client("x");
    table.add_subscriber(&x, Some("kind = 'a'"), Some("news"), "ep", 0);
    let message = Message::new(FEED, "x")
        .with_subtopic("news")
        .with_header("kind", "a");
    let before = table.get_subscriber_ids(&message, true);

    assert!(!table.remove_subscriber(&x, Some("kind = 'b'"), Some("news")));
    assert!(!table.remove_subscriber(&x, Some("kind = 'a'"), Some("sports")));
    assert!(!table.remove_subscriber(&x, None, Some("news")));
    assert!(!table.remove_subscriber(&client("y"), Some("kind = 'a'"), Some("news")));

    assert_eq!(table.get_subscriber_ids(&message, true), before);
    assert_eq!(table.client_subscriptions().len(), 1);
}

#[test_case("a/*", "a/b", true ; "single wildcard one level")]
#[test_case("a/*", "a/b/c", false ; "single wildcard stops at one level")]
#[test_case("a/**", "a/b", true ; "multi wildcard one level")]
#[test_case("a/**", "a/b/c", true ; "multi wildcard many levels")]
#[test_case("a/*/c", "a/b/c", true ; "inner wildcard")]
#[test_case("a/b", "a/b/c", false ; "literal is exact")]
fn test_wildcard_matching(pattern: &str, published: &str, expected: bool) {
    let mut config = DestinationConfig::new(FEED);
    config.subtopic_separator = Some("/".to_string());
    let service = standalone(config);
    subscribe(&service, "x", Some(pattern), None);

    publish(&service, "x", published);
    assert_eq!(poll(&service, "x").len(), usize::from(expected));
}

#[test]
fn test_wildcard_publish_rejected() {
    let mut config = DestinationConfig::new(FEED);
    config.subtopic_separator = Some("/".to_string());
    let service = standalone(config);
    subscribe(&service, "x", Some("a/**"), None);

    for subtopic in ["a/*", "a/**"] {
        let result = service.service_message(Message::new(FEED, "x").with_subtopic(subtopic));
        assert!(matches!(
            result,
            Err(MessagingError::WildcardSubtopicOnPublish(_))
        ));
    }
    assert!(poll(&service, "x").is_empty());
}

#[test]
fn test_snapshot_under_concurrent_churn() {
    let table = Arc::new(SubscriptionTable::new(FEED, ".", Arc::new(HeaderSelectorFactory)));
    let anchor = SubscriptionCriteria::new(Some("anchor"), None);
    table.add_subscriber(&client("anchor"), None, Some("anchor"), "ep-anchor", 0);

    let universe: BTreeSet<SubscriptionCriteria> = (0..4)
        .flat_map(|t| {
            (0..8).map(move |k| {
                SubscriptionCriteria::new(
                    Some(format!("w{}.s{}", t, k).as_str()),
                    Some(format!("k = {}", k).as_str()),
                )
            })
        })
        .chain(std::iter::once(anchor.clone()))
        .collect();

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let table = table.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let id = client(&format!("w{}", t));
                for _ in 0..500 {
                    let k: u32 = rng.gen_range(0..8);
                    let subtopic = format!("w{}.s{}", t, k);
                    let selector = format!("k = {}", k);
                    if rng.gen_bool(0.6) {
                        table.add_subscriber(&id, Some(selector.as_str()), Some(subtopic.as_str()), "ep", 0);
                    } else {
                        table.remove_subscriber(&id, Some(selector.as_str()), Some(subtopic.as_str()));
                    }
                }
            })
        })
        .collect();

    for _ in 0..200 {
        let snapshot = table.subscription_state();
        assert!(snapshot.entries.contains(&anchor));
        for entry in &snapshot.entries {
            assert!(universe.contains(entry), "unexpected entry {:?}", entry);
        }
        for subscription in table.client_subscriptions() {
            let expected_endpoint = if &*subscription.client_id == "anchor" {
                "ep-anchor"
            } else {
                "ep"
            };
            assert_eq!(subscription.endpoint_id, expected_endpoint);
        }
    }
    for writer in writers {
        writer.join().unwrap();
    }

    // Once quiet, the snapshot and the per-client view agree
    let settled: BTreeSet<_> = table.subscription_state().entries.into_iter().collect();
    let from_clients: BTreeSet<_> = table
        .client_subscriptions()
        .into_iter()
        .map(|s| SubscriptionCriteria::new(s.subtopic.as_deref(), s.selector.as_deref()))
        .collect();
    assert_eq!(settled, from_clients);
}

#[test]
fn test_failing_recipient_does_not_stop_dispatch() {
    let service = standalone(DestinationConfig::new(FEED));
    let router = Arc::new(BrokenLink {
        broken: client("c2"),
        delivered: Mutex::new(Vec::new()),
    });
    let log = Arc::new(DispatchLog::default());
    service.set_router(router.clone());
    service.add_routed_listener(log.clone());
    for id in ["c1", "c2", "c3"] {
        subscribe(&service, id, None, None);
    }

    service.service_message(Message::new(FEED, "x")).unwrap();
    assert_eq!(*router.delivered.lock(), vec![client("c1"), client("c3")]);
    assert_eq!(*log.calls.lock(), vec![(2, false)]);
}

// ============================================================================
// Cluster
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_startup_exchanges_subscription_state() {
    let cluster = LoopbackCluster::new();
    let a = node(&cluster, "a", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    let b = node(&cluster, "b", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    subscribe(&a, "x", Some("news.*"), None);
    subscribe(&b, "y", None, Some("region = 'eu'"));
    cluster.quiesce();

    tokio::join!(a.start(), b.start());
    cluster.quiesce();

    assert!(a.is_started() && b.is_started());
    assert_eq!(cluster.sent("a", "sendSubscriptions"), 1);
    assert_eq!(cluster.sent("b", "sendSubscriptions"), 1);
    assert_eq!(remote_view(&b, "a"), local_state(&a));
    assert_eq!(remote_view(&a, "b"), local_state(&b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publish_reaches_subscriber_on_other_node() {
    let cluster = LoopbackCluster::new();
    let mut config = DestinationConfig::clustered(FEED, RoutingMode::ServerToServer);
    config.priority = Some(4);
    let a = node(&cluster, "a", config.clone());
    let b = node(&cluster, "b", config);
    tokio::join!(a.start(), b.start());

    subscribe(&a, "x", Some("news.*"), None);
    cluster.quiesce();

    b.service_message(
        Message::new(FEED, "hello")
            .with_subtopic("news.sports")
            .with_header(SENDER_CLIENT_ID_HEADER, "publisher"),
    )
    .unwrap();
    publish(&b, "rain", "weather.today");
    cluster.quiesce();

    let received = poll(&a, "x");
    assert_eq!(received.len(), 1);
    assert_eq!(&received[0].body[..], b"hello");
    assert!(received[0].header(SENDER_CLIENT_ID_HEADER).is_none());
    assert_eq!(received[0].priority(), Some(4));
    assert_eq!(cluster.sent("a", "pushMessageFromPeerToPeer"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_peer_discards_unmatched_message() {
    let cluster = LoopbackCluster::new();
    let a = node(&cluster, "a", DestinationConfig::clustered(FEED, RoutingMode::Broadcast));
    let b = node(&cluster, "b", DestinationConfig::clustered(FEED, RoutingMode::Broadcast));
    tokio::join!(a.start(), b.start());
    let log = Arc::new(DispatchLog::default());
    b.add_routed_listener(log.clone());

    publish(&a, "x", "news.sports");
    cluster.quiesce();

    assert_eq!(cluster.sent("b", "pushMessageFromPeer"), 1);
    assert_eq!(*log.calls.lock(), vec![(0, true)]);

    // Broadcast destinations never exchange subscription state
    assert_eq!(cluster.sent_total("sendSubscriptions"), 0);
    assert_eq!(cluster.sent_total("subscribeFromPeer"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_to_server_skips_uninterested_peer() {
    let cluster = LoopbackCluster::new();
    let a = node(&cluster, "a", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    let b = node(&cluster, "b", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    tokio::join!(a.start(), b.start());
    let log = Arc::new(DispatchLog::default());
    b.add_routed_listener(log.clone());

    subscribe(&b, "y", Some("weather.*"), None);
    cluster.quiesce();

    publish(&a, "x", "news.sports");
    cluster.quiesce();
    assert_eq!(cluster.sent("b", "pushMessageFromPeerToPeer"), 0);
    assert!(log.calls.lock().is_empty());

    publish(&a, "x", "weather.today");
    cluster.quiesce();
    assert_eq!(cluster.sent("b", "pushMessageFromPeerToPeer"), 1);
    assert_eq!(poll(&b, "y").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_selector_filters_before_sending() {
    let cluster = LoopbackCluster::new();
    let a = node(&cluster, "a", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    let b = node(&cluster, "b", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    tokio::join!(a.start(), b.start());

    subscribe(&b, "y", None, Some("region = 'eu'"));
    cluster.quiesce();

    a.service_message(Message::new(FEED, "x").with_header("region", "us"))
        .unwrap();
    a.service_message(Message::new(FEED, "x").with_header("region", "eu"))
        .unwrap();
    cluster.quiesce();

    assert_eq!(cluster.sent("b", "pushMessageFromPeerToPeer"), 1);
    assert_eq!(poll(&b, "y").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interest_follows_first_and_last_subscriber() {
    let cluster = LoopbackCluster::new();
    let a = node(&cluster, "a", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    let b = node(&cluster, "b", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    tokio::join!(a.start(), b.start());

    subscribe(&a, "x1", Some("news.*"), None);
    subscribe(&a, "x2", Some("news.*"), None);
    cluster.quiesce();
    assert_eq!(cluster.sent("b", "subscribeFromPeer"), 1);

    // One holder left, the pair is still of interest
    unsubscribe(&a, "x1", Some("news.*"), None);
    cluster.quiesce();
    assert_eq!(
        remote_view(&b, "a"),
        vec![SubscriptionCriteria::new(Some("news.*"), None)]
    );

    a.disconnect_client(&client("x2"));
    cluster.quiesce();
    assert_eq!(cluster.sent("b", "subscribeFromPeer"), 2);
    assert!(remote_view(&b, "a").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_joiner_converges_under_churn() {
    let cluster = LoopbackCluster::new();
    let config = DestinationConfig::clustered(FEED, RoutingMode::ServerToServer);
    let a = node(&cluster, "a", config.clone());
    let c = node(&cluster, "c", config.clone());
    tokio::join!(a.start(), c.start());

    let churn = |service: Arc<MessageService>, prefix: &'static str| {
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for i in 0..300 {
                let id = format!("{}{}", prefix, i % 5);
                let subtopic = format!("{}.t{}", prefix, rng.gen_range(0..6));
                if rng.gen_bool(0.6) {
                    subscribe(&service, &id, Some(subtopic.as_str()), None);
                } else {
                    unsubscribe(&service, &id, Some(subtopic.as_str()), None);
                }
            }
        })
    };
    let writers = [churn(a.clone(), "a"), churn(c.clone(), "c")];

    let d = node(&cluster, "d", config);
    d.start().await;

    for writer in writers {
        writer.join().unwrap();
    }
    cluster.quiesce();

    assert_eq!(remote_view(&d, "a"), local_state(&a));
    assert_eq!(remote_view(&d, "c"), local_state(&c));
    assert_eq!(remote_view(&a, "d"), local_state(&d));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_interest_converges_under_concurrent_churn() {
    let cluster = LoopbackCluster::new();
    let config = DestinationConfig::clustered(FEED, RoutingMode::ServerToServer);
    let a = node(&cluster, "a", config.clone());
    let b = node(&cluster, "b", config);
    tokio::join!(a.start(), b.start());

    for round in 0..10 {
        // Every thread churns the same criteria with its own client
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let service = a.clone();
                thread::spawn(move || {
                    let id = format!("c{}", t);
                    for _ in 0..500 {
                        subscribe(&service, &id, Some("x"), None);
                        unsubscribe(&service, &id, Some("x"), None);
                    }
                    if t == 0 {
                        subscribe(&service, &id, Some("x"), None);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        cluster.quiesce();

        assert_eq!(remote_view(&b, "a"), local_state(&a), "round {}", round);

        b.service_message(Message::new(FEED, "ping").with_subtopic("x")).unwrap();
        cluster.quiesce();
        assert_eq!(poll(&a, "c0").len(), 1, "round {}", round);

        unsubscribe(&a, "c0", Some("x"), None);
        cluster.quiesce();
        assert!(remote_view(&b, "a").is_empty(), "round {}", round);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatch_isolation_for_peer_messages() {
    let cluster = LoopbackCluster::new();
    let a = node(&cluster, "a", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    let b = node(&cluster, "b", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    tokio::join!(a.start(), b.start());

    let router = Arc::new(BrokenLink {
        broken: client("c2"),
        delivered: Mutex::new(Vec::new()),
    });
    let log = Arc::new(DispatchLog::default());
    a.set_router(router.clone());
    a.add_routed_listener(log.clone());
    for id in ["c1", "c2", "c3"] {
        subscribe(&a, id, None, None);
    }
    cluster.quiesce();

    b.service_message(Message::new(FEED, "x")).unwrap();
    cluster.quiesce();

    assert_eq!(*router.delivered.lock(), vec![client("c1"), client("c3")]);
    assert_eq!(*log.calls.lock(), vec![(2, true)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_departed_member_is_forgotten() {
    let cluster = LoopbackCluster::new();
    let a = node(&cluster, "a", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    let b = node(&cluster, "b", DestinationConfig::clustered(FEED, RoutingMode::ServerToServer));
    tokio::join!(a.start(), b.start());

    subscribe(&b, "y", None, None);
    cluster.quiesce();
    let destination = a.destination(FEED).unwrap();
    assert!(destination.remote_subscriptions().is_synchronized(&client("b")));

    cluster.leave("b");
    cluster.quiesce();
    assert!(destination.remote_subscriptions().peer_state(&client("b")).is_none());

    cluster.reset_counts();
    publish(&a, "x", "news");
    cluster.quiesce();
    assert_eq!(cluster.sent_total("pushMessageFromPeerToPeer"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_before_start_are_ignored() {
    let cluster = LoopbackCluster::new();
    let a = node(&cluster, "a", DestinationConfig::clustered(FEED, RoutingMode::Broadcast));
    let b = node(&cluster, "b", DestinationConfig::clustered(FEED, RoutingMode::Broadcast));
    subscribe(&b, "y", None, None);
    a.start().await;

    publish(&a, "early", "news");
    cluster.quiesce();
    assert!(poll(&b, "y").is_empty());

    b.start().await;
    publish(&a, "late", "news");
    cluster.quiesce();
    let received = poll(&b, "y");
    assert_eq!(received.len(), 1);
    assert_eq!(&received[0].body[..], b"late");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_explicit_priority_survives_the_cluster() {
    let cluster = LoopbackCluster::new();
    let mut config = DestinationConfig::clustered(FEED, RoutingMode::Broadcast);
    config.priority = Some(4);
    let a = node(&cluster, "a", config.clone());
    let b = node(&cluster, "b", config);
    tokio::join!(a.start(), b.start());
    subscribe(&b, "y", None, None);

    a.service_message(Message::new(FEED, "x").with_header(PRIORITY_HEADER, 7i64))
        .unwrap();
    cluster.quiesce();
    assert_eq!(poll(&b, "y")[0].priority(), Some(7));
}
