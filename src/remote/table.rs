//! Remote Subscription Table
//!
//! Mirrors the aggregate subscription interest of every other node for one
//! destination, keyed by node address. Each node gets a slot that is either
//! awaiting its full state or accepting incremental updates; a full state
//! always replaces the slot wholesale.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::{ClientId, Message};
use crate::selector::{Selector, SelectorFactory};
use crate::topic::{SubscriptionCriteria, SubscriptionIndex, SubscriptionSnapshot};

/// Replication state of one peer's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSyncState {
    /// Full state requested, not yet received; updates are dropped since
    /// the pending state will already contain them
    Requested,
    /// The peer asked for our state; we accept its updates from an empty start
    Seeded,
    /// Full state installed
    Synchronized,
}

#[derive(Debug)]
struct PeerSlot {
    state: PeerSyncState,
    criteria: AHashSet<SubscriptionCriteria>,
}

impl PeerSlot {
    fn new(state: PeerSyncState) -> Self {
        Self {
            state,
            criteria: AHashSet::new(),
        }
    }
}

#[derive(Debug)]
struct RemoteState {
    index: SubscriptionIndex,
    peers: AHashMap<ClientId, PeerSlot>,
}

impl RemoteState {
    fn clear_peer(&mut self, peer: &ClientId) {
        if let Some(slot) = self.peers.get_mut(peer) {
            for criteria in slot.criteria.drain() {
                self.index.remove(peer, &criteria);
            }
        }
    }
}

/// Subscription interest of the other nodes for one destination
pub struct RemoteSubscriptionTable {
    destination: String,
    selectors: Arc<dyn SelectorFactory>,
    state: RwLock<RemoteState>,
    synchronized: Notify,
}

impl RemoteSubscriptionTable {
    pub fn new(destination: &str, separator: &str, selectors: Arc<dyn SelectorFactory>) -> Self {
        Self {
            destination: destination.to_string(),
            selectors,
            state: RwLock::new(RemoteState {
                index: SubscriptionIndex::new(separator),
                peers: AHashMap::new(),
            }),
            synchronized: Notify::new(),
        }
    }

    /// Peer selectors that fail to compile match everything; the receiving
    /// node evaluates them again against its own subscribers.
    fn compile_selector(&self, expression: Option<&str>) -> Option<Arc<dyn Selector>> {
        let expression = expression?;
        match self.selectors.compile(expression) {
            Ok(selector) => Some(selector),
            Err(e) => {
                debug!(
                    "Destination '{}': peer selector '{}' forwarded unfiltered: {}",
                    self.destination, expression, e
                );
                None
            }
        }
    }

    /// Note that the peer's full state was requested
    pub fn mark_requested(&self, peer: &ClientId) {
        let mut state = self.state.write();
        state
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerSlot::new(PeerSyncState::Requested))
            .state = PeerSyncState::Requested;
    }

    /// Open an empty slot for a peer that asked for our state, so its
    /// updates are accepted before its own full state arrives
    pub fn seed(&self, peer: &ClientId) {
        let mut state = self.state.write();
        state
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerSlot::new(PeerSyncState::Seeded));
    }

    /// Replace everything known about the peer with its full state
    pub fn install(&self, peer: &ClientId, snapshot: &SubscriptionSnapshot) {
        {
            let mut state = self.state.write();
            state.clear_peer(peer);

            let mut criteria = AHashSet::with_capacity(snapshot.len());
            for entry in &snapshot.entries {
                let selector = self.compile_selector(entry.selector.as_deref());
                state.index.insert(peer, entry, selector);
                criteria.insert(entry.clone());
            }
            state.peers.insert(
                peer.clone(),
                PeerSlot {
                    state: PeerSyncState::Synchronized,
                    criteria,
                },
            );
        }
        debug!(
            "Destination '{}': installed {} subscriptions from '{}'",
            self.destination,
            snapshot.len(),
            peer
        );
        self.synchronized.notify_waiters();
    }

    /// Apply one interest change from a peer
    ///
    /// Returns false when the update was dropped because the peer has no
    /// slot or its full state is still pending.
    pub fn apply(
        &self,
        peer: &ClientId,
        subscribe: bool,
        selector: Option<&str>,
        subtopic: Option<&str>,
    ) -> bool {
        let criteria = SubscriptionCriteria::new(subtopic, selector);
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(slot) = state.peers.get_mut(peer) else {
            debug!(
                "Destination '{}': dropping update from unknown peer '{}'",
                self.destination, peer
            );
            return false;
        };
        if slot.state == PeerSyncState::Requested {
            debug!(
                "Destination '{}': dropping update from '{}' until its state arrives",
                self.destination, peer
            );
            return false;
        }

        if subscribe {
            if slot.criteria.insert(criteria.clone()) {
                let compiled = self.compile_selector(criteria.selector.as_deref());
                state.index.insert(peer, &criteria, compiled);
            }
        } else if slot.criteria.remove(&criteria) {
            state.index.remove(peer, &criteria);
        }
        true
    }

    /// Forget a peer that left the cluster
    pub fn remove_peer(&self, peer: &ClientId) {
        let mut state = self.state.write();
        state.clear_peer(peer);
        state.peers.remove(peer);
    }

    /// Peers holding interest that matches the message
    pub fn matching_peers(&self, message: &Message, eval_selector: bool) -> BTreeSet<ClientId> {
        let mut out = BTreeSet::new();
        let Ok(subtopics) = message.subtopics() else {
            return out;
        };
        self.state
            .read()
            .index
            .collect_matching(&subtopics, message, eval_selector, &mut out);
        out
    }

    pub fn peer_state(&self, peer: &ClientId) -> Option<PeerSyncState> {
        self.state.read().peers.get(peer).map(|slot| slot.state)
    }

    pub fn is_synchronized(&self, peer: &ClientId) -> bool {
        self.peer_state(peer) == Some(PeerSyncState::Synchronized)
    }

    /// Interest currently recorded for a peer, sorted
    pub fn peer_subscriptions(&self, peer: &ClientId) -> Vec<SubscriptionCriteria> {
        let state = self.state.read();
        let mut out: Vec<_> = state
            .peers
            .get(peer)
            .map(|slot| slot.criteria.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Wait until the peer's full state is installed or the timeout passes
    pub async fn wait_synchronized(&self, peer: &ClientId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.synchronized.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_synchronized(peer) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_synchronized(peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::HeaderSelectorFactory;
    use pretty_assertions::assert_eq;

    fn table() -> RemoteSubscriptionTable {
        RemoteSubscriptionTable::new("feed", ".", Arc::new(HeaderSelectorFactory))
    }

    fn id(s: &str) -> ClientId {
        Arc::from(s)
    }

    fn criteria(subtopic: &str) -> SubscriptionCriteria {
        SubscriptionCriteria::new(Some(subtopic), None)
    }

    fn snapshot(subtopics: &[&str]) -> SubscriptionSnapshot {
        SubscriptionSnapshot::new(subtopics.iter().map(|s| criteria(s)).collect())
    }

    #[test]
    fn test_snapshot_then_deltas() {
        let table = table();
        let peer = id("node-b");
        table.mark_requested(&peer);

        table.install(&peer, &snapshot(&["a", "b"]));
        assert!(table.apply(&peer, false, None, Some("a")));
        assert!(table.apply(&peer, true, None, Some("c")));

        assert_eq!(table.peer_subscriptions(&peer), vec![criteria("b"), criteria("c")]);
    }

    #[test]
    fn test_install_replaces_wholesale() {
        let table = table();
        let peer = id("node-b");
        table.seed(&peer);
        table.apply(&peer, true, None, Some("stale"));

        table.install(&peer, &snapshot(&["fresh"]));
        assert_eq!(table.peer_subscriptions(&peer), vec![criteria("fresh")]);

        let stale = Message::new("feed", "x").with_subtopic("stale");
        assert!(table.matching_peers(&stale, true).is_empty());
    }

    #[test]
    fn test_updates_dropped_without_slot_or_while_requested() {
        let table = table();
        let peer = id("node-b");
        assert!(!table.apply(&peer, true, None, Some("a")));

        table.mark_requested(&peer);
        assert!(!table.apply(&peer, true, None, Some("a")));
        assert!(table.peer_subscriptions(&peer).is_empty());
    }

    #[test]
    fn test_peers_are_independent() {
        let table = table();
        let b = id("node-b");
        let c = id("node-c");
        table.seed(&b);
        table.seed(&c);

        table.apply(&b, true, None, Some("a"));
        table.install(&c, &snapshot(&["a"]));
        table.apply(&b, false, None, Some("a"));

        let msg = Message::new("feed", "x").with_subtopic("a");
        assert_eq!(table.matching_peers(&msg, true).into_iter().collect::<Vec<_>>(), vec![c]);
    }

    #[test]
    fn test_selector_matching_and_fallback() {
        let table = table();
        let b = id("node-b");
        let c = id("node-c");
        table.seed(&b);
        table.seed(&c);
        table.apply(&b, true, Some("n > 5"), Some("a"));
        table.apply(&c, true, Some("n ~ 5"), Some("a"));

        let msg = Message::new("feed", "x").with_subtopic("a").with_header("n", 1i64);
        let peers: Vec<_> = table.matching_peers(&msg, true).into_iter().collect();
        assert_eq!(peers, vec![c.clone()]);

        let msg = Message::new("feed", "x").with_subtopic("a").with_header("n", 9i64);
        assert_eq!(table.matching_peers(&msg, true).len(), 2);
    }

    #[test]
    fn test_remove_peer() {
        let table = table();
        let b = id("node-b");
        table.install(&b, &snapshot(&["a"]));
        table.remove_peer(&b);

        assert_eq!(table.peer_state(&b), None);
        let msg = Message::new("feed", "x").with_subtopic("a");
        assert!(table.matching_peers(&msg, true).is_empty());
    }

    #[tokio::test]
    async fn test_wait_synchronized() {
        let table = Arc::new(table());
        let b = id("node-b");
        table.mark_requested(&b);

        assert!(!table.wait_synchronized(&b, Duration::from_millis(20)).await);

        let waiter = {
            let table = table.clone();
            let b = b.clone();
            tokio::spawn(async move { table.wait_synchronized(&b, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        table.install(&b, &SubscriptionSnapshot::default());
        assert!(waiter.await.unwrap());
    }
}
