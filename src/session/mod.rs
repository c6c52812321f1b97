//! Client Outbound Queues
//!
//! Each connected client owns a bounded outbox. The dispatcher pushes
//! prepared per-recipient copies into it; the endpoint layer drains it on
//! poll or waits on it for streaming delivery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::broker::{DeliveryError, MessageRouter};
use crate::protocol::{ClientId, Message};
use crate::topic::Subscriber;

/// Bounded outbound queue of one client
pub struct ClientOutbox {
    client_id: ClientId,
    queue: ArrayQueue<Message>,
    closed: AtomicBool,
    /// Messages refused because the queue was full
    dropped: AtomicU64,
    notify: Notify,
}

impl ClientOutbox {
    pub fn new(client_id: ClientId, capacity: usize) -> Self {
        Self {
            client_id,
            queue: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn push(&self, message: Message) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::ClientGone(self.client_id.clone()));
        }
        if self.queue.push(message).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(DeliveryError::QueueFull(self.client_id.clone()));
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take every queued message, oldest first
    pub fn drain(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(message) = self.queue.pop() {
            out.push(message);
        }
        out
    }

    /// Wait until a message is queued or the outbox closes
    pub async fn wait(&self) {
        if !self.queue.is_empty() || self.is_closed() {
            return;
        }
        self.notify.notified().await;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outboxes of all clients known to a service
pub struct OutboxRegistry {
    capacity: usize,
    outboxes: DashMap<ClientId, Arc<ClientOutbox>>,
}

impl OutboxRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outboxes: DashMap::new(),
        }
    }

    /// Get the client's outbox, creating it on first use
    pub fn register(&self, client_id: &ClientId) -> Arc<ClientOutbox> {
        self.outboxes
            .entry(client_id.clone())
            .or_insert_with(|| Arc::new(ClientOutbox::new(client_id.clone(), self.capacity)))
            .clone()
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientOutbox>> {
        self.outboxes.get(client_id).map(|o| o.value().clone())
    }

    /// Close and forget the client's outbox; returns undelivered messages
    pub fn unregister(&self, client_id: &ClientId) -> Vec<Message> {
        match self.outboxes.remove(client_id) {
            Some((_, outbox)) => {
                outbox.close();
                let pending = outbox.drain();
                if !pending.is_empty() {
                    debug!(
                        "Client '{}' left with {} undelivered messages",
                        client_id,
                        pending.len()
                    );
                }
                pending
            }
            None => Vec::new(),
        }
    }

    /// Like `unregister`, but only when `idle` still holds
    ///
    /// `idle` runs while the client's entry is locked, so a concurrent
    /// `register` for the same client waits for the decision.
    pub fn unregister_if(
        &self,
        client_id: &ClientId,
        idle: impl FnOnce() -> bool,
    ) -> Option<Vec<Message>> {
        let (_, outbox) = self.outboxes.remove_if(client_id, |_, _| idle())?;
        outbox.close();
        Some(outbox.drain())
    }

    /// Queued messages for the client, or None if it has no outbox
    pub fn drain(&self, client_id: &ClientId) -> Option<Vec<Message>> {
        self.get(client_id).map(|outbox| outbox.drain())
    }

    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }
}

impl MessageRouter for OutboxRegistry {
    fn route_message_to_client(
        &self,
        message: Message,
        subscriber: &Subscriber,
    ) -> Result<(), DeliveryError> {
        let client_id = subscriber.client_id();
        match self.outboxes.get(client_id) {
            Some(outbox) => outbox.push(message),
            None => Err(DeliveryError::ClientGone(client_id.clone())),
        }
    }
}
