//! Message Rate Throttling
//!
//! Limits how many messages per second a destination accepts and emits:
//! - Inbound, destination-wide and per sending client
//! - Outbound, destination-wide and per receiving client (each subscriber's
//!   own max frequency)
//!
//! Inbound excess is dropped silently or rejected back to the sender
//! depending on the configured policy; outbound excess is always dropped.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::protocol::{ClientId, Message};

const WINDOW: Duration = Duration::from_secs(1);

/// What happens to inbound messages over the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottlePolicy {
    /// Drop silently
    #[default]
    Ignore,
    /// Reject back to the sender
    Error,
}

/// Throttle configuration for one destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Policy for inbound messages over either inbound limit
    pub policy: ThrottlePolicy,
    /// Messages per second accepted by the destination (0 = unlimited)
    pub max_inbound_frequency: u32,
    /// Messages per second accepted from a single client (0 = unlimited)
    pub max_client_inbound_frequency: u32,
    /// Messages per second pushed to subscribers (0 = unlimited)
    pub max_outbound_frequency: u32,
}

impl ThrottleConfig {
    pub fn is_enabled(&self) -> bool {
        self.max_inbound_frequency > 0
            || self.max_client_inbound_frequency > 0
            || self.max_outbound_frequency > 0
    }
}

/// Outcome of an inbound throttle check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allow,
    /// Drop without telling the sender
    Ignore,
    /// Reject the request
    Reject,
}

/// Sliding one-second window of recent message timestamps
#[derive(Debug, Default)]
pub struct MessageFrequency {
    history: VecDeque<Instant>,
}

impl MessageFrequency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message at `now` if fewer than `max_frequency` were recorded
    /// in the preceding second. Returns false when over the limit.
    pub fn try_record(&mut self, max_frequency: u32, now: Instant) -> bool {
        if max_frequency == 0 {
            return true;
        }
        while let Some(oldest) = self.history.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                self.history.pop_front();
            } else {
                break;
            }
        }
        if self.history.len() >= max_frequency as usize {
            return false;
        }
        self.history.push_back(now);
        true
    }

    /// Whether nothing was recorded in the window ending at `now`
    pub fn is_idle(&self, now: Instant) -> bool {
        self.history
            .back()
            .map_or(true, |last| now.saturating_duration_since(*last) >= WINDOW)
    }

    /// Messages recorded in the window ending at `now`
    pub fn current(&self, now: Instant) -> usize {
        self.history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < WINDOW)
            .count()
    }
}

/// Per-destination throttle state
pub struct ThrottleManager {
    destination: String,
    config: ThrottleConfig,
    inbound: Mutex<MessageFrequency>,
    inbound_clients: DashMap<ClientId, MessageFrequency>,
    outbound: Mutex<MessageFrequency>,
    outbound_clients: DashMap<ClientId, MessageFrequency>,
    last_sweep: Mutex<Instant>,
}

impl ThrottleManager {
    pub fn new(destination: &str, config: ThrottleConfig) -> Self {
        Self {
            destination: destination.to_string(),
            config,
            inbound: Mutex::new(MessageFrequency::new()),
            inbound_clients: DashMap::new(),
            outbound: Mutex::new(MessageFrequency::new()),
            outbound_clients: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn over_limit(&self) -> ThrottleDecision {
        match self.config.policy {
            ThrottlePolicy::Ignore => ThrottleDecision::Ignore,
            ThrottlePolicy::Error => ThrottleDecision::Reject,
        }
    }

    /// Check a message published to the destination
    pub fn throttle_incoming(&self, message: &Message) -> ThrottleDecision {
        self.throttle_incoming_at(message, Instant::now())
    }

    pub fn throttle_incoming_at(&self, message: &Message, now: Instant) -> ThrottleDecision {
        if !self
            .inbound
            .lock()
            .try_record(self.config.max_inbound_frequency, now)
        {
            debug!(
                "Destination '{}': inbound limit {} msg/s reached",
                self.destination, self.config.max_inbound_frequency
            );
            return self.over_limit();
        }

        self.sweep_idle_clients(now);

        let limit = self.config.max_client_inbound_frequency;
        if let (Some(client_id), true) = (&message.client_id, limit > 0) {
            let allowed = self
                .inbound_clients
                .entry(client_id.clone())
                .or_default()
                .try_record(limit, now);
            if !allowed {
                debug!(
                    "Destination '{}': client '{}' over inbound limit {} msg/s",
                    self.destination, client_id, limit
                );
                return self.over_limit();
            }
        }

        ThrottleDecision::Allow
    }

    /// Whether the destination-wide outbound limit drops this push
    pub fn throttle_outgoing(&self, now: Instant) -> bool {
        let allowed = self
            .outbound
            .lock()
            .try_record(self.config.max_outbound_frequency, now);
        if !allowed {
            debug!(
                "Destination '{}': outbound limit {} msg/s reached",
                self.destination, self.config.max_outbound_frequency
            );
        }
        !allowed
    }

    /// Whether a recipient's own max frequency drops this delivery
    pub fn throttle_outgoing_client(
        &self,
        client_id: &ClientId,
        max_frequency: u32,
        now: Instant,
    ) -> bool {
        if max_frequency == 0 {
            return false;
        }
        !self
            .outbound_clients
            .entry(client_id.clone())
            .or_default()
            .try_record(max_frequency, now)
    }

    /// Forget clients with nothing in their window, at most once per window
    ///
    /// An idle history limits nothing, so senders that never subscribe do
    /// not accumulate state.
    fn sweep_idle_clients(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock();
            if now.saturating_duration_since(*last) < WINDOW {
                return;
            }
            *last = now;
        }
        self.inbound_clients.retain(|_, f| !f.is_idle(now));
        self.outbound_clients.retain(|_, f| !f.is_idle(now));
    }

    /// Clients with per-client throttle state
    pub fn tracked_clients(&self) -> usize {
        self.inbound_clients.len() + self.outbound_clients.len()
    }

    /// Drop per-client state once a client leaves the destination
    pub fn forget_client(&self, client_id: &ClientId) {
        self.inbound_clients.remove(client_id);
        self.outbound_clients.remove(client_id);
    }
}
