//! Loopback Cluster
//!
//! In-process cluster for running several message services side by side.
//! Each node has one inbox drained by its own worker thread, so operations
//! from one node to another are handled in the order they were sent, just
//! as over a peer link. Sends are counted per target and operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::protocol::ClientId;
use crate::remote::{ClusterEvent, ClusterEventCallback, ClusterOperation, ClusterTransport, RemoteError};

struct LoopbackNode {
    inbox: Sender<ClusterEvent>,
    worker: JoinHandle<()>,
}

/// Events enqueued but not yet handled
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// A set of in-process nodes connected by ordered queues
#[derive(Default)]
pub struct LoopbackCluster {
    nodes: RwLock<BTreeMap<ClientId, LoopbackNode>>,
    pending: Arc<Pending>,
    sent: Mutex<HashMap<(ClientId, &'static str), usize>>,
}

impl LoopbackCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node; existing members see it join
    ///
    /// `handler` runs on the node's worker thread for every event.
    pub fn join(
        self: &Arc<Self>,
        address: &str,
        handler: ClusterEventCallback,
    ) -> Arc<LoopbackTransport> {
        let address = ClientId::from(address);
        let (inbox, events) = unbounded::<ClusterEvent>();
        let pending = self.pending.clone();
        let worker = std::thread::spawn(move || {
            for event in events {
                handler(event);
                pending.done();
            }
        });

        let mut nodes = self.nodes.write();
        for (member, node) in nodes.iter() {
            debug!("Loopback: '{}' sees '{}' join", member, address);
            self.pending.add();
            if node.inbox.send(ClusterEvent::MemberJoined(address.clone())).is_err() {
                self.pending.done();
            }
        }
        nodes.insert(address.clone(), LoopbackNode { inbox, worker });
        drop(nodes);

        Arc::new(LoopbackTransport {
            cluster: self.clone(),
            address,
        })
    }

    /// Remove a node; its queued events are still handled, and the
    /// remaining members see it leave
    pub fn leave(&self, address: &str) {
        let address = ClientId::from(address);
        let removed = self.nodes.write().remove(&address);
        let Some(node) = removed else {
            return;
        };
        drop(node.inbox);
        let _ = node.worker.join();

        for (member, node) in self.nodes.read().iter() {
            debug!("Loopback: '{}' sees '{}' leave", member, address);
            self.pending.add();
            if node.inbox.send(ClusterEvent::MemberLeft(address.clone())).is_err() {
                self.pending.done();
            }
        }
    }

    /// Block until every queued event has been handled
    pub fn quiesce(&self) {
        self.pending.wait_idle();
    }

    /// How many times `operation` was sent to `target`
    pub fn sent(&self, target: &str, operation: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|((to, name), _)| to.as_ref() == target && *name == operation)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Total sends of `operation` to any node
    pub fn sent_total(&self, operation: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|((_, name), _)| *name == operation)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn reset_counts(&self) {
        self.sent.lock().clear();
    }

    pub fn members(&self) -> Vec<ClientId> {
        self.nodes.read().keys().cloned().collect()
    }

    fn deliver(
        &self,
        from: &ClientId,
        to: &ClientId,
        operation: ClusterOperation,
    ) -> Result<(), RemoteError> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(to)
            .ok_or_else(|| RemoteError::UnknownPeer(to.to_string()))?;
        *self
            .sent
            .lock()
            .entry((to.clone(), operation.name()))
            .or_insert(0) += 1;

        self.pending.add();
        let event = ClusterEvent::Operation {
            from: from.clone(),
            operation,
        };
        node.inbox.send(event).map_err(|_| {
            self.pending.done();
            RemoteError::ConnectionLost(to.to_string())
        })
    }
}

/// One node's view of a loopback cluster
pub struct LoopbackTransport {
    cluster: Arc<LoopbackCluster>,
    address: ClientId,
}

impl LoopbackTransport {
    pub fn cluster(&self) -> &Arc<LoopbackCluster> {
        &self.cluster
    }
}

impl ClusterTransport for LoopbackTransport {
    fn local_address(&self) -> ClientId {
        self.address.clone()
    }

    fn member_addresses(&self) -> Vec<ClientId> {
        self.cluster
            .members()
            .into_iter()
            .filter(|m| *m != self.address)
            .collect()
    }

    fn broadcast(&self, operation: ClusterOperation) -> Result<(), RemoteError> {
        for member in self.member_addresses() {
            self.cluster
                .deliver(&self.address, &member, operation.clone())?;
        }
        Ok(())
    }

    fn send_to(&self, member: &ClientId, operation: ClusterOperation) -> Result<(), RemoteError> {
        self.cluster.deliver(&self.address, member, operation)
    }
}
