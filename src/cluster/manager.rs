//! Cluster Manager
//!
//! Coordinates gossip-based cluster membership and the peer links that
//! carry cluster operations between VibeBus nodes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use dashmap::DashMap;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::protocol::ClientId;
use crate::remote::{
    ClusterEvent, ClusterEventCallback, ClusterOperation, ClusterTransport, RemoteError,
};

use super::peer::{write_message, ClusterPeer, FrameReader};
use super::protocol::{ClusterMessage, CLUSTER_PROTOCOL_VERSION};

/// Chitchat state keys
const KEY_PEER_ADDR: &str = "peer_addr";

/// Cluster manager for gossip-based horizontal scaling
pub struct ClusterManager {
    /// Our node ID
    node_id: ClientId,
    /// Cluster configuration
    config: ClusterConfig,
    /// Chitchat handle for gossip communication
    chitchat: ChitchatHandle,
    /// Outbound links to live members
    peers: Arc<DashMap<ClientId, Arc<ClusterPeer>>>,
    /// Receives membership changes and inbound operations
    events: ClusterEventCallback,
}

impl ClusterManager {
    /// Create a new cluster manager
    pub async fn new(
        config: ClusterConfig,
        events: ClusterEventCallback,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let node_id = config.resolve_node_id();
        let gossip_advertise_addr = config.advertised_gossip_addr();
        let peer_advertise_addr = config.advertised_peer_addr();

        info!(
            "Starting cluster node: {} (gossip_advertise={}, peer_advertise={})",
            node_id, gossip_advertise_addr, peer_advertise_addr
        );

        // A restarted node gets a new generation, so peers see it as a new member
        let generation = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let chitchat_id = ChitchatId::new(node_id.clone(), generation, gossip_advertise_addr);

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: config.gossip_interval,
            max_interval: config.failure_timeout,
            ..Default::default()
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: "vibebus".to_string(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.gossip_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kvs = vec![(KEY_PEER_ADDR.to_string(), peer_advertise_addr.to_string())];
        let chitchat = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport).await?;

        Ok(Self {
            node_id: ClientId::from(node_id),
            config,
            chitchat,
            peers: Arc::new(DashMap::new()),
            events,
        })
    }

    /// Get our node ID
    pub fn node_id(&self) -> &ClientId {
        &self.node_id
    }

    /// Start the cluster manager background tasks
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            "Cluster manager starting on gossip={}, peer={}",
            self.config.gossip_addr, self.config.peer_addr
        );

        // Accepts the links other nodes open to deliver operations to us
        let listener = TcpListener::bind(self.config.peer_addr).await?;
        let events = self.events.clone();
        let local_node_id = self.node_id.clone();
        let queue_capacity = self.config.peer_queue_capacity;

        tokio::spawn(async move {
            Self::peer_listener_loop(listener, events, local_node_id, queue_capacity).await;
        });

        let chitchat = self.chitchat.chitchat();
        let peers = self.peers.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let local_node_id = self.node_id.clone();

        tokio::spawn(async move {
            Self::gossip_watcher_loop(chitchat, peers, config, events, local_node_id).await;
        });

        Ok(())
    }

    /// Stop the cluster manager
    pub async fn stop(&self) {
        info!("Stopping cluster manager");

        for peer in self.peers.iter() {
            peer.value().stop().await;
        }
        self.peers.clear();
    }

    /// Listen for incoming peer connections
    async fn peer_listener_loop(
        listener: TcpListener,
        events: ClusterEventCallback,
        local_node_id: ClientId,
        queue_capacity: usize,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming cluster peer connection from {}", addr);

                    let events = events.clone();
                    let node_id = local_node_id.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_incoming_peer(stream, events, node_id, queue_capacity).await
                        {
                            debug!("Incoming peer connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept peer connection: {}", e);
                }
            }
        }
    }

    /// Handle an incoming peer connection
    ///
    /// Operations run one at a time in arrival order on a blocking worker
    /// owned by this connection, which keeps the sender's ordering intact
    /// while snapshots and fan-out stay off the runtime threads.
    async fn handle_incoming_peer(
        stream: TcpStream,
        events: ClusterEventCallback,
        local_node_id: ClientId,
        queue_capacity: usize,
    ) -> Result<(), RemoteError> {
        stream.set_nodelay(true).ok();
        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FrameReader::new(read_half);

        let hello = tokio::time::timeout(Duration::from_secs(10), frames.next())
            .await
            .map_err(|_| RemoteError::Timeout)??;

        let peer_node_id = match hello {
            Some(ClusterMessage::Hello { node_id, version }) => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RemoteError::Rejected(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                ClientId::from(node_id)
            }
            Some(other) => {
                return Err(RemoteError::Other(format!(
                    "Expected Hello, got {}",
                    other.type_name()
                )));
            }
            None => return Err(RemoteError::ConnectionLost("Connection closed".to_string())),
        };

        info!("Incoming cluster peer: {}", peer_node_id);

        let ack = ClusterMessage::HelloAck {
            node_id: local_node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_message(&mut write_half, &ack).await?;

        let (operations, mut inbox) = mpsc::channel::<ClusterEvent>(queue_capacity.max(1));
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(event) = inbox.blocking_recv() {
                events(event);
            }
        });

        let result =
            Self::read_operations(&mut frames, &mut write_half, &peer_node_id, &operations).await;

        // Operations already received still run before the worker exits
        drop(operations);
        if let Err(e) = worker.await {
            error!("Cluster peer '{}': operation worker failed: {}", peer_node_id, e);
        }
        result
    }

    async fn read_operations(
        frames: &mut FrameReader<OwnedReadHalf>,
        write_half: &mut OwnedWriteHalf,
        peer_node_id: &ClientId,
        operations: &mpsc::Sender<ClusterEvent>,
    ) -> Result<(), RemoteError> {
        loop {
            match frames.next().await? {
                Some(ClusterMessage::Operation(operation)) => {
                    debug!(
                        "Cluster inbound: {} from {} for '{}'",
                        operation.name(),
                        peer_node_id,
                        operation.destination()
                    );
                    let event = ClusterEvent::Operation {
                        from: peer_node_id.clone(),
                        operation,
                    };
                    if operations.send(event).await.is_err() {
                        return Err(RemoteError::Other("Operation worker stopped".to_string()));
                    }
                }
                Some(ClusterMessage::Ping) => {
                    write_message(write_half, &ClusterMessage::Pong).await?;
                }
                Some(ClusterMessage::Goodbye) => {
                    info!("Cluster peer '{}' said goodbye", peer_node_id);
                    return Ok(());
                }
                Some(other) => {
                    debug!(
                        "Cluster inbound: ignoring {} from {}",
                        other.type_name(),
                        peer_node_id
                    );
                }
                None => {
                    info!("Cluster peer '{}' disconnected", peer_node_id);
                    return Ok(());
                }
            }
        }
    }

    /// Watch gossip state for members joining and leaving
    ///
    /// A member that reappears with a new generation restarted and lost its
    /// state, so it is reported as leaving and joining again.
    async fn gossip_watcher_loop(
        chitchat: Arc<tokio::sync::Mutex<chitchat::Chitchat>>,
        peers: Arc<DashMap<ClientId, Arc<ClusterPeer>>>,
        config: ClusterConfig,
        events: ClusterEventCallback,
        local_node_id: ClientId,
    ) {
        let mut known_nodes: HashMap<ClientId, u64> = HashMap::new();

        loop {
            tokio::time::sleep(config.gossip_interval).await;

            let live: Vec<(ChitchatId, Option<String>)> = {
                let cc = chitchat.lock().await;
                let ids: Vec<ChitchatId> = cc.live_nodes().cloned().collect();
                ids.into_iter()
                    .map(|id| {
                        let peer_addr = cc
                            .node_state(&id)
                            .and_then(|state| state.get(KEY_PEER_ADDR))
                            .map(str::to_string);
                        (id, peer_addr)
                    })
                    .collect()
            };

            let mut current: HashMap<ClientId, u64> = HashMap::new();
            for (chitchat_id, peer_addr) in live {
                let node_id = ClientId::from(chitchat_id.node_id.as_str());
                if node_id == local_node_id {
                    continue;
                }
                current.insert(node_id.clone(), chitchat_id.generation_id);

                match known_nodes.get(&node_id) {
                    Some(&generation) if generation == chitchat_id.generation_id => continue,
                    Some(_) => {
                        info!("Cluster peer '{}' restarted", node_id);
                        Self::remove_member(&peers, &events, &node_id).await;
                    }
                    None => {}
                }

                let Some(peer_addr) = peer_addr.and_then(|a| a.parse::<SocketAddr>().ok()) else {
                    // Retried on the next tick, once the key has been gossiped
                    current.remove(&node_id);
                    continue;
                };

                info!(
                    "Discovered cluster peer: {} at peer={} gossip={}",
                    node_id, peer_addr, chitchat_id.gossip_advertise_addr
                );
                let peer = ClusterPeer::new(node_id.clone(), peer_addr, local_node_id.clone())
                    .spawn(config.peer_queue_capacity);
                peers.insert(node_id.clone(), peer);
                events(ClusterEvent::MemberJoined(node_id));
            }

            let gone: Vec<ClientId> = known_nodes
                .keys()
                .filter(|n| !current.contains_key(*n))
                .cloned()
                .collect();
            for node_id in gone {
                info!("Cluster peer '{}' left the cluster", node_id);
                Self::remove_member(&peers, &events, &node_id).await;
            }

            known_nodes = current;
        }
    }

    async fn remove_member(
        peers: &DashMap<ClientId, Arc<ClusterPeer>>,
        events: &ClusterEventCallback,
        node_id: &ClientId,
    ) {
        if let Some((_, peer)) = peers.remove(node_id) {
            peer.stop().await;
        }
        events(ClusterEvent::MemberLeft(node_id.clone()));
    }

    fn peer(&self, member: &ClientId) -> Result<Arc<ClusterPeer>, RemoteError> {
        self.peers
            .get(member)
            .map(|p| p.value().clone())
            .ok_or_else(|| RemoteError::UnknownPeer(member.to_string()))
    }
}

impl ClusterTransport for ClusterManager {
    fn local_address(&self) -> ClientId {
        self.node_id.clone()
    }

    fn member_addresses(&self) -> Vec<ClientId> {
        let mut members: Vec<_> = self.peers.iter().map(|p| p.key().clone()).collect();
        members.sort();
        members
    }

    fn broadcast(&self, operation: ClusterOperation) -> Result<(), RemoteError> {
        let peers: Vec<_> = self.peers.iter().map(|p| p.value().clone()).collect();
        let mut result = Ok(());
        for peer in peers {
            if let Err(e) = peer.send(operation.clone()) {
                warn!(
                    "Cluster: {} to '{}' not queued: {}",
                    operation.name(),
                    peer.node_id(),
                    e
                );
                result = Err(e);
            }
        }
        result
    }

    fn send_to(&self, member: &ClientId, operation: ClusterOperation) -> Result<(), RemoteError> {
        self.peer(member)?.send(operation)
    }
}

// ClusterManager is Send + Sync because all its fields are thread-safe
unsafe impl Send for ClusterManager {}
unsafe impl Sync for ClusterManager {}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn operation(destination: &str) -> ClusterMessage {
        ClusterMessage::Operation(ClusterOperation::SendSubscriptions {
            destination: destination.to_string(),
        })
    }

    #[tokio::test]
    async fn test_slow_operations_do_not_stall_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Each operation blocks its handler until released
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let handled = Arc::new(Mutex::new(Vec::new()));
        let events: ClusterEventCallback = {
            let handled = handled.clone();
            Arc::new(move |event| {
                if let ClusterEvent::Operation { operation, .. } = event {
                    gate.lock().recv().ok();
                    handled.lock().push(operation.destination().to_string());
                }
            })
        };
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            ClusterManager::handle_incoming_peer(stream, events, "node-a".into(), 8).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FrameReader::new(read_half);
        let hello = ClusterMessage::Hello {
            node_id: "node-b".to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_message(&mut write_half, &hello).await.unwrap();
        assert!(matches!(
            frames.next().await.unwrap(),
            Some(ClusterMessage::HelloAck { .. })
        ));

        write_message(&mut write_half, &operation("one")).await.unwrap();
        write_message(&mut write_half, &operation("two")).await.unwrap();
        write_message(&mut write_half, &ClusterMessage::Ping).await.unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("link stalled behind a blocked operation")
            .unwrap();
        assert_eq!(pong, Some(ClusterMessage::Pong));

        release.send(()).unwrap();
        release.send(()).unwrap();
        write_message(&mut write_half, &ClusterMessage::Goodbye).await.unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(*handled.lock(), vec!["one".to_string(), "two".to_string()]);
    }
}
