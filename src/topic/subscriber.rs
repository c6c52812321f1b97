//! Live subscriber handles

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use tracing::warn;

use crate::protocol::{ClientId, Message};
use crate::selector::Selector;

use super::index::SubscriptionCriteria;
use super::subtopic::Subtopic;
use super::ClientSubscription;

#[derive(Debug, Clone)]
struct SubscriptionEntry {
    subtopic: Option<Subtopic>,
    selector: Option<Arc<dyn Selector>>,
    max_frequency: u32,
}

/// A client registered on one destination
///
/// The handle stays valid while the client holds at least one subscription.
/// Dispatch resolves recipients to handles and skips invalidated ones, since
/// a client may leave between subscriber lookup and delivery.
#[derive(Debug)]
pub struct Subscriber {
    client_id: ClientId,
    endpoint_id: RwLock<String>,
    subscriptions: RwLock<AHashMap<SubscriptionCriteria, SubscriptionEntry>>,
    valid: AtomicBool,
}

impl Subscriber {
    pub(crate) fn new(client_id: ClientId, endpoint_id: &str) -> Self {
        Self {
            client_id,
            endpoint_id: RwLock::new(endpoint_id.to_string()),
            subscriptions: RwLock::new(AHashMap::new()),
            valid: AtomicBool::new(true),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn endpoint_id(&self) -> String {
        self.endpoint_id.read().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Lowest non-zero max frequency across the client's subscriptions
    pub fn max_frequency(&self) -> u32 {
        self.subscriptions
            .read()
            .values()
            .map(|e| e.max_frequency)
            .filter(|f| *f > 0)
            .min()
            .unwrap_or(0)
    }

    pub fn has_subscription(&self, criteria: &SubscriptionCriteria) -> bool {
        self.subscriptions.read().contains_key(criteria)
    }

    /// Record a subscription; an existing one only has its frequency and
    /// endpoint refreshed. Returns true if it was new.
    pub(crate) fn add(
        &self,
        criteria: SubscriptionCriteria,
        subtopic: Option<Subtopic>,
        selector: Option<Arc<dyn Selector>>,
        endpoint_id: &str,
        max_frequency: u32,
    ) -> bool {
        if !endpoint_id.is_empty() {
            let mut endpoint = self.endpoint_id.write();
            if endpoint.as_str() != endpoint_id {
                *endpoint = endpoint_id.to_string();
            }
        }

        let mut subscriptions = self.subscriptions.write();
        if let Some(entry) = subscriptions.get_mut(&criteria) {
            entry.max_frequency = max_frequency;
            return false;
        }
        subscriptions.insert(
            criteria,
            SubscriptionEntry {
                subtopic,
                selector,
                max_frequency,
            },
        );
        true
    }

    /// Returns true if the subscription existed
    pub(crate) fn remove(&self, criteria: &SubscriptionCriteria) -> bool {
        self.subscriptions.write().remove(criteria).is_some()
    }

    pub fn subscriptions(&self) -> Vec<ClientSubscription> {
        let endpoint_id = self.endpoint_id();
        let mut out: Vec<ClientSubscription> = self
            .subscriptions
            .read()
            .iter()
            .map(|(criteria, entry)| ClientSubscription {
                client_id: self.client_id.clone(),
                subtopic: criteria.subtopic.clone(),
                selector: criteria.selector.clone(),
                endpoint_id: endpoint_id.clone(),
                max_frequency: entry.max_frequency,
            })
            .collect();
        out.sort();
        out
    }

    /// Re-test a message against this client's own subscriptions
    pub fn test_message(&self, message: &Message) -> bool {
        let subtopics = match message.subtopics() {
            Ok(subtopics) => subtopics,
            Err(_) => return false,
        };

        self.subscriptions.read().values().any(|entry| {
            let subtopic_matches = match entry.subtopic {
                None => subtopics.is_empty(),
                Some(ref pattern) => subtopics.iter().any(|s| pattern.matches(s)),
            };
            if !subtopic_matches {
                return false;
            }
            match entry.selector {
                None => true,
                Some(ref selector) => match selector.matches(message) {
                    Ok(matched) => matched,
                    Err(e) => {
                        warn!(
                            "Client '{}': treating subscription as non-matching: {}",
                            self.client_id, e
                        );
                        false
                    }
                },
            }
        })
    }
}
