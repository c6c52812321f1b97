//! Prometheus metrics for VibeBus
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All VibeBus metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Message metrics
    pub messages_received: IntCounter,
    pub messages_delivered: IntCounter,
    pub messages_throttled: IntCounterVec,
    pub delivery_failures: IntCounterVec,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub subscriptions_total: IntCounter,
    pub unsubscriptions_total: IntCounter,

    // Cluster metrics
    pub cluster_peers_current: IntGauge,
    pub cluster_operations_sent: IntCounterVec,
    pub cluster_operations_received: IntCounterVec,
    pub peer_messages_pushed: IntCounter,

    // Performance metrics
    pub dispatch_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // Message metrics
        let messages_received = IntCounter::with_opts(Opts::new(
            "vibebus_messages_received_total",
            "Total messages published by clients",
        ))
        .unwrap();

        let messages_delivered = IntCounter::with_opts(Opts::new(
            "vibebus_messages_delivered_total",
            "Total per-client message copies queued for delivery",
        ))
        .unwrap();

        let messages_throttled = IntCounterVec::new(
            Opts::new(
                "vibebus_messages_throttled_total",
                "Messages dropped or rejected by rate limits",
            ),
            &["direction"],
        )
        .unwrap();

        let delivery_failures = IntCounterVec::new(
            Opts::new(
                "vibebus_delivery_failures_total",
                "Per-client deliveries that failed during fan-out",
            ),
            &["reason"],
        )
        .unwrap();

        // Subscription metrics
        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "vibebus_subscriptions_current",
            "Current number of client subscriptions",
        ))
        .unwrap();

        let subscriptions_total = IntCounter::with_opts(Opts::new(
            "vibebus_subscriptions_total",
            "Total subscriptions since startup",
        ))
        .unwrap();

        let unsubscriptions_total = IntCounter::with_opts(Opts::new(
            "vibebus_unsubscriptions_total",
            "Total unsubscriptions since startup",
        ))
        .unwrap();

        // Cluster metrics
        let cluster_peers_current = IntGauge::with_opts(Opts::new(
            "vibebus_cluster_peers_current",
            "Current number of live cluster members",
        ))
        .unwrap();

        let cluster_operations_sent = IntCounterVec::new(
            Opts::new(
                "vibebus_cluster_operations_sent_total",
                "Cluster operations sent to other nodes",
            ),
            &["operation"],
        )
        .unwrap();

        let cluster_operations_received = IntCounterVec::new(
            Opts::new(
                "vibebus_cluster_operations_received_total",
                "Cluster operations received from other nodes",
            ),
            &["operation"],
        )
        .unwrap();

        let peer_messages_pushed = IntCounter::with_opts(Opts::new(
            "vibebus_peer_messages_pushed_total",
            "Messages from other nodes redelivered to local subscribers",
        ))
        .unwrap();

        // Performance metrics
        let dispatch_latency = Histogram::with_opts(
            HistogramOpts::new(
                "vibebus_dispatch_latency_seconds",
                "Time to fan a message out to local subscribers",
            )
            .buckets(vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
            ]),
        )
        .unwrap();

        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_delivered.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_throttled.clone()))
            .unwrap();
        registry
            .register(Box::new(delivery_failures.clone()))
            .unwrap();
        registry
            .register(Box::new(subscriptions_current.clone()))
            .unwrap();
        registry
            .register(Box::new(subscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(unsubscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(cluster_peers_current.clone()))
            .unwrap();
        registry
            .register(Box::new(cluster_operations_sent.clone()))
            .unwrap();
        registry
            .register(Box::new(cluster_operations_received.clone()))
            .unwrap();
        registry
            .register(Box::new(peer_messages_pushed.clone()))
            .unwrap();
        registry
            .register(Box::new(dispatch_latency.clone()))
            .unwrap();

        Metrics {
            registry,
            messages_received,
            messages_delivered,
            messages_throttled,
            delivery_failures,
            subscriptions_current,
            subscriptions_total,
            unsubscriptions_total,
            cluster_peers_current,
            cluster_operations_sent,
            cluster_operations_received,
            peer_messages_pushed,
            dispatch_latency,
        }
    }

    // Helper methods for common operations

    pub fn message_received(&self) {
        self.messages_received.inc();
    }

    pub fn messages_delivered(&self, count: usize) {
        self.messages_delivered.inc_by(count as u64);
    }

    pub fn message_throttled(&self, direction: &str) {
        self.messages_throttled.with_label_values(&[direction]).inc();
    }

    pub fn delivery_failed(&self, reason: &str) {
        self.delivery_failures.with_label_values(&[reason]).inc();
    }

    pub fn subscription_added(&self) {
        self.subscriptions_current.inc();
        self.subscriptions_total.inc();
    }

    pub fn subscriptions_removed(&self, count: usize) {
        self.subscriptions_current.sub(count as i64);
        self.unsubscriptions_total.inc_by(count as u64);
    }

    pub fn cluster_peer_connected(&self) {
        self.cluster_peers_current.inc();
    }

    pub fn cluster_peer_disconnected(&self) {
        self.cluster_peers_current.dec();
    }

    pub fn cluster_operation_sent(&self, operation: &str) {
        self.cluster_operations_sent
            .with_label_values(&[operation])
            .inc();
    }

    pub fn cluster_operation_received(&self, operation: &str) {
        self.cluster_operations_received
            .with_label_values(&[operation])
            .inc();
    }

    pub fn peer_message_pushed(&self) {
        self.peer_messages_pushed.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
