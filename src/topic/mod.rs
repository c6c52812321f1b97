//! Subtopic matching and subscription management
//!
//! Implements subtopic pattern validation, a subtopic trie for efficient
//! matching, and the per-destination subscription table mapping
//! (subtopic, selector) criteria to client ids.
//!
//! Performance optimizations:
//! - Members sharing a selector are grouped so each selector runs once per
//!   publish
//! - Uses callback-based trie matching to avoid intermediate allocations

mod index;
mod subscriber;
pub mod subtopic;
mod trie;

pub use index::SubscriptionCriteria;
pub(crate) use index::SubscriptionIndex;
pub use subscriber::Subscriber;
pub use subtopic::{validate_separator, Subtopic, SubtopicError, MULTI_WILDCARD, SINGLE_WILDCARD};
pub use trie::SubtopicTrie;

use std::collections::BTreeSet;
use std::sync::Arc;

use bincode::{Decode, Encode};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::protocol::{ClientId, Headers, Message, SUBTOPIC_HEADER};
use crate::selector::{Selector, SelectorFactory, UnparsedSelector};

/// One registered interest of one client
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientSubscription {
    pub client_id: ClientId,
    pub subtopic: Option<String>,
    pub selector: Option<String>,
    pub endpoint_id: String,
    /// Messages per second, 0 = unlimited
    pub max_frequency: u32,
}

/// Aggregate subscription interest of a node, exchanged with cluster peers
///
/// Lists each distinct (subtopic, selector) pair once, regardless of how
/// many local clients hold it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct SubscriptionSnapshot {
    pub entries: Vec<SubscriptionCriteria>,
}

impl SubscriptionSnapshot {
    pub fn new(mut entries: Vec<SubscriptionCriteria>) -> Self {
        entries.sort();
        entries.dedup();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Thread-safe subscription table for one destination
///
/// Single-entry mutations are internally synchronized; callers that need a
/// snapshot consistent with other tables (cluster state transfer) coordinate
/// through the service-level guard instead.
pub struct SubscriptionTable {
    destination: String,
    separator: String,
    selectors: Arc<dyn SelectorFactory>,
    /// Lock order: index before subscribers
    index: RwLock<SubscriptionIndex>,
    subscribers: DashMap<ClientId, Arc<Subscriber>>,
}

impl SubscriptionTable {
    pub fn new(destination: &str, separator: &str, selectors: Arc<dyn SelectorFactory>) -> Self {
        Self {
            destination: destination.to_string(),
            separator: separator.to_string(),
            selectors,
            index: RwLock::new(SubscriptionIndex::new(separator)),
            subscribers: DashMap::new(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    fn compile_selector(&self, expression: Option<&str>) -> Option<Arc<dyn Selector>> {
        let expression = expression?;
        match self.selectors.compile(expression) {
            Ok(selector) => Some(selector),
            Err(e) => {
                debug!(
                    "Destination '{}': keeping unparsed selector '{}': {}",
                    self.destination, expression, e
                );
                Some(Arc::new(UnparsedSelector::new(expression, e)))
            }
        }
    }

    /// Register a subscription
    ///
    /// Re-adding an identical (client, subtopic, selector) tuple updates its
    /// endpoint and max frequency. Returns true when this is the first local
    /// subscription for the (subtopic, selector) pair.
    pub fn add_subscriber(
        &self,
        client_id: &ClientId,
        selector: Option<&str>,
        subtopic: Option<&str>,
        endpoint_id: &str,
        max_frequency: u32,
    ) -> bool {
        let criteria = SubscriptionCriteria::new(subtopic, selector);
        let pattern = match criteria.subtopic.as_deref() {
            None => None,
            Some(s) => match Subtopic::new(s, &self.separator) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    debug_assert!(false, "unvalidated subtopic reached the table: {}", e);
                    warn!("Destination '{}': ignoring subscription: {}", self.destination, e);
                    return false;
                }
            },
        };

        let mut index = self.index.write();
        let subscriber = self
            .subscribers
            .entry(client_id.clone())
            .or_insert_with(|| Arc::new(Subscriber::new(client_id.clone(), endpoint_id)))
            .clone();

        if subscriber.has_subscription(&criteria) {
            subscriber.add(criteria, pattern, None, endpoint_id, max_frequency);
            return false;
        }

        let compiled = self.compile_selector(criteria.selector.as_deref());
        let created = index.insert(client_id, &criteria, compiled.clone());
        subscriber.add(criteria, pattern, compiled, endpoint_id, max_frequency);
        created
    }

    /// Remove the exact (client, subtopic, selector) tuple
    ///
    /// Unknown tuples are ignored. Returns true when the (subtopic, selector)
    /// pair lost its last local subscriber.
    pub fn remove_subscriber(
        &self,
        client_id: &ClientId,
        selector: Option<&str>,
        subtopic: Option<&str>,
    ) -> bool {
        let criteria = SubscriptionCriteria::new(subtopic, selector);

        let mut index = self.index.write();
        let Some(subscriber) = self.subscribers.get(client_id).map(|s| s.value().clone()) else {
            return false;
        };
        if !subscriber.remove(&criteria) {
            return false;
        }

        let emptied = index.remove(client_id, &criteria);
        if subscriber.subscription_count() == 0 {
            self.subscribers.remove(client_id);
            subscriber.invalidate();
        }
        emptied
    }

    /// Drop every subscription held by a client
    ///
    /// Returns the (subtopic, selector) pairs that lost their last local
    /// subscriber.
    pub fn remove_client(&self, client_id: &ClientId) -> Vec<SubscriptionCriteria> {
        let mut index = self.index.write();
        let Some((_, subscriber)) = self.subscribers.remove(client_id) else {
            return Vec::new();
        };
        subscriber.invalidate();
        index.remove_member(client_id)
    }

    /// Clients whose subscriptions match the message
    ///
    /// With `eval_selector` false only subtopics are compared, for callers
    /// that already evaluated selectors themselves.
    pub fn get_subscriber_ids(&self, message: &Message, eval_selector: bool) -> BTreeSet<ClientId> {
        let mut out = BTreeSet::new();
        let subtopics = match message.subtopics() {
            Ok(subtopics) => subtopics,
            Err(e) => {
                warn!("Destination '{}': {}", self.destination, e);
                return out;
            }
        };
        self.index
            .read()
            .collect_matching(&subtopics, message, eval_selector, &mut out);
        out
    }

    /// Clients matching a subtopic and header set, without a full message
    pub fn get_subscriber_ids_for(
        &self,
        subtopic: Option<&str>,
        headers: &Headers,
    ) -> BTreeSet<ClientId> {
        let mut probe = Message::new(self.destination.as_str(), Bytes::new());
        probe.headers = headers.clone();
        match subtopic {
            Some(s) => probe.set_header(SUBTOPIC_HEADER, s),
            None => {
                probe.remove_header(SUBTOPIC_HEADER);
            }
        }
        self.get_subscriber_ids(&probe, true)
    }

    /// Live handle for a client, if it still holds subscriptions
    pub fn subscriber(&self, client_id: &ClientId) -> Option<Arc<Subscriber>> {
        self.subscribers.get(client_id).map(|s| s.value().clone())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Distinct (subtopic, selector) pairs with at least one subscriber
    pub fn subscription_state(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot::new(self.index.read().criteria())
    }

    /// Every client subscription, consistent with respect to concurrent
    /// single-entry mutations
    pub fn client_subscriptions(&self) -> Vec<ClientSubscription> {
        let _index = self.index.read();
        let mut out: Vec<ClientSubscription> = self
            .subscribers
            .iter()
            .flat_map(|s| s.value().subscriptions())
            .collect();
        out.sort();
        out
    }

    /// Replace the whole table with the given subscriptions
    pub fn restore(&self, subscriptions: &[ClientSubscription]) {
        {
            let mut index = self.index.write();
            *index = SubscriptionIndex::new(&self.separator);
            for entry in self.subscribers.iter() {
                entry.value().invalidate();
            }
            self.subscribers.clear();
        }
        for sub in subscriptions {
            self.add_subscriber(
                &sub.client_id,
                sub.selector.as_deref(),
                sub.subtopic.as_deref(),
                &sub.endpoint_id,
                sub.max_frequency,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::HeaderSelectorFactory;
    use pretty_assertions::assert_eq;

    fn table() -> SubscriptionTable {
        SubscriptionTable::new("feed", ".", Arc::new(HeaderSelectorFactory))
    }

    fn id(s: &str) -> ClientId {
        Arc::from(s)
    }

    fn ids(set: BTreeSet<ClientId>) -> Vec<String> {
        set.into_iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_add_is_idempotent() {
        let table = table();
        assert!(table.add_subscriber(&id("c1"), None, Some("news.*"), "ep", 0));
        assert!(!table.add_subscriber(&id("c1"), None, Some("news.*"), "ep2", 5));

        let subs = table.client_subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].endpoint_id, "ep2");
        assert_eq!(subs[0].max_frequency, 5);

        let msg = Message::new("feed", "x").with_subtopic("news.sports");
        assert_eq!(ids(table.get_subscriber_ids(&msg, true)), vec!["c1"]);
    }

    #[test]
    fn test_remove_is_exact_match() {
        let table = table();
        table.add_subscriber(&id("c1"), Some("a = 1"), Some("news.*"), "ep", 0);

        assert!(!table.remove_subscriber(&id("c1"), None, Some("news.*")));
        assert!(!table.remove_subscriber(&id("c1"), Some("a = 1"), Some("news.sports")));
        assert!(!table.remove_subscriber(&id("c2"), Some("a = 1"), Some("news.*")));
        assert_eq!(table.client_subscriptions().len(), 1);

        assert!(table.remove_subscriber(&id("c1"), Some("a = 1"), Some("news.*")));
        assert!(table.client_subscriptions().is_empty());
        assert!(table.subscriber(&id("c1")).is_none());
    }

    #[test]
    fn test_handle_invalidated_when_last_subscription_leaves() {
        let table = table();
        table.add_subscriber(&id("c1"), None, Some("a"), "ep", 0);
        table.add_subscriber(&id("c1"), None, Some("b"), "ep", 0);
        let handle = table.subscriber(&id("c1")).unwrap();

        table.remove_subscriber(&id("c1"), None, Some("a"));
        assert!(handle.is_valid());
        table.remove_subscriber(&id("c1"), None, Some("b"));
        assert!(!handle.is_valid());
    }

    #[test]
    fn test_first_and_last_subscriber_per_criteria() {
        let table = table();
        assert!(table.add_subscriber(&id("c1"), None, Some("a"), "ep", 0));
        assert!(!table.add_subscriber(&id("c2"), None, Some("a"), "ep", 0));
        assert!(table.add_subscriber(&id("c2"), Some("x = 1"), Some("a"), "ep", 0));

        assert!(!table.remove_subscriber(&id("c1"), None, Some("a")));
        assert!(table.remove_subscriber(&id("c2"), None, Some("a")));
    }

    #[test]
    fn test_selector_filtering() {
        let table = table();
        table.add_subscriber(&id("hot"), Some("temp > 30"), Some("weather.*"), "ep", 0);
        table.add_subscriber(&id("all"), None, Some("weather.*"), "ep", 0);

        let msg = Message::new("feed", "x")
            .with_subtopic("weather.today")
            .with_header("temp", 20i64);
        assert_eq!(ids(table.get_subscriber_ids(&msg, true)), vec!["all"]);
        assert_eq!(ids(table.get_subscriber_ids(&msg, false)), vec!["all", "hot"]);
    }

    #[test]
    fn test_selector_evaluation_error_does_not_match() {
        let table = table();
        table.add_subscriber(&id("c1"), Some("temp > 30"), None, "ep", 0);
        table.add_subscriber(&id("c2"), None, None, "ep", 0);

        let msg = Message::new("feed", "x").with_header("temp", "hot");
        assert_eq!(ids(table.get_subscriber_ids(&msg, true)), vec!["c2"]);
    }

    #[test]
    fn test_unparsable_selector_never_matches() {
        let table = table();
        table.add_subscriber(&id("c1"), Some("JMSType ~ 'x'"), None, "ep", 0);

        let msg = Message::new("feed", "x");
        assert!(table.get_subscriber_ids(&msg, true).is_empty());
        assert_eq!(ids(table.get_subscriber_ids(&msg, false)), vec!["c1"]);
    }

    #[test]
    fn test_get_subscriber_ids_for_headers() {
        let table = table();
        table.add_subscriber(&id("c1"), Some("region = 'eu'"), Some("a.**"), "ep", 0);

        let mut headers = Headers::new();
        headers.insert("region".to_string(), "eu".into());
        assert_eq!(ids(table.get_subscriber_ids_for(Some("a.b.c"), &headers)), vec!["c1"]);
        assert!(table.get_subscriber_ids_for(None, &headers).is_empty());
    }

    #[test]
    fn test_remove_client() {
        let table = table();
        table.add_subscriber(&id("c1"), None, Some("a"), "ep", 0);
        table.add_subscriber(&id("c2"), None, Some("a"), "ep", 0);
        table.add_subscriber(&id("c1"), None, Some("b"), "ep", 0);

        let emptied = table.remove_client(&id("c1"));
        assert_eq!(emptied, vec![SubscriptionCriteria::new(Some("b"), None)]);
        assert!(table.subscriber(&id("c1")).is_none());
        assert!(table.remove_client(&id("c1")).is_empty());
    }

    #[test]
    fn test_subscription_state_and_restore() {
        let table = table();
        table.add_subscriber(&id("c1"), None, Some("a"), "ep", 0);
        table.add_subscriber(&id("c2"), None, Some("a"), "ep", 3);
        table.add_subscriber(&id("c2"), Some("x = 1"), None, "ep", 3);

        let state = table.subscription_state();
        assert_eq!(
            state.entries,
            vec![
                SubscriptionCriteria::new(None, Some("x = 1")),
                SubscriptionCriteria::new(Some("a"), None),
            ]
        );

        let dump = table.client_subscriptions();
        let copy = self::table();
        copy.add_subscriber(&id("stale"), None, None, "ep", 0);
        copy.restore(&dump);
        assert_eq!(copy.client_subscriptions(), dump);
        assert_eq!(copy.subscriber(&id("c2")).unwrap().max_frequency(), 3);
    }

    #[test]
    fn test_test_message() {
        let table = table();
        table.add_subscriber(&id("c1"), Some("n > 1"), Some("a.*"), "ep", 0);
        let handle = table.subscriber(&id("c1")).unwrap();

        let hit = Message::new("feed", "x").with_subtopic("a.b").with_header("n", 2i64);
        let wrong_subtopic = Message::new("feed", "x").with_subtopic("b.b").with_header("n", 2i64);
        let wrong_selector = Message::new("feed", "x").with_subtopic("a.b").with_header("n", 0i64);
        assert!(handle.test_message(&hit));
        assert!(!handle.test_message(&wrong_subtopic));
        assert!(!handle.test_message(&wrong_selector));
    }
}
