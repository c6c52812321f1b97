//! Cluster Peer
//!
//! Outbound link to another node in the cluster. Operations are queued on
//! a bounded channel and written in order over a single TCP connection, so
//! everything one node sends to another arrives in the order it was sent.
//! Inbound operations arrive on the connection the other node opens to us
//! and are handled by the cluster manager.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::ClientId;
use crate::remote::{ClusterOperation, RemoteError, RemotePeerStatus};

use super::protocol::{
    frame_message, read_frame_length, ClusterMessage, CLUSTER_PROTOCOL_VERSION, MAX_FRAME_LEN,
};

/// Commands sent to the peer connection task
#[derive(Debug)]
enum PeerCommand {
    /// Deliver an operation to the peer's message service
    Send(ClusterOperation),
    /// Shutdown the connection
    Shutdown,
}

/// Reassembles frames from the read half of a link
///
/// Bytes already received stay in the buffer when `next` is dropped
/// mid-frame, so it can be raced against other branches in `select!`.
pub(super) struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(super) fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    /// Next frame; `None` when the stream ended cleanly between frames
    pub(super) async fn next(&mut self) -> Result<Option<ClusterMessage>, RemoteError> {
        loop {
            if let Some(msg) = self.take_frame()? {
                return Ok(Some(msg));
            }
            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RemoteError::ConnectionLost(format!(
                    "Stream ended inside a frame ({} bytes buffered)",
                    self.buf.len()
                )));
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<ClusterMessage>, RemoteError> {
        let Some(len) = read_frame_length(&self.buf) else {
            return Ok(None);
        };
        if len > MAX_FRAME_LEN {
            return Err(RemoteError::Rejected(format!("Frame too large: {} bytes", len)));
        }
        let total = 4 + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        let frame = self.buf.split_to(total);
        ClusterMessage::decode(&frame[4..])
            .map(Some)
            .map_err(|e| RemoteError::Other(format!("Decode error: {}", e)))
    }
}

/// Frame and write one message
pub(super) async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &ClusterMessage,
) -> Result<(), RemoteError> {
    let frame =
        frame_message(msg).map_err(|e| RemoteError::Other(format!("Encode error: {}", e)))?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| RemoteError::ConnectionLost(e.to_string()))
}

/// A connection to another cluster node
pub struct ClusterPeer {
    /// Remote node ID
    node_id: ClientId,
    /// Remote peer address for TCP connection
    peer_addr: SocketAddr,
    /// Current connection status
    status: Arc<RwLock<RemotePeerStatus>>,
    /// Command channel for sending operations to the connection task
    command_tx: Option<mpsc::Sender<PeerCommand>>,
    /// Our local node ID, sent in the handshake
    local_node_id: ClientId,
    /// Set once the peer is stopped; ends reconnect attempts
    shutdown: Arc<AtomicBool>,
}

impl ClusterPeer {
    /// Create a new cluster peer
    pub fn new(node_id: ClientId, peer_addr: SocketAddr, local_node_id: ClientId) -> Self {
        Self {
            node_id,
            peer_addr,
            status: Arc::new(RwLock::new(RemotePeerStatus::Disconnected)),
            command_tx: None,
            local_node_id,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the remote node ID
    pub fn node_id(&self) -> &ClientId {
        &self.node_id
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn status(&self) -> RemotePeerStatus {
        *self.status.read()
    }

    /// Queue an operation for the peer without waiting
    ///
    /// Operations queue up while the link reconnects; a full queue fails
    /// the send instead of blocking the caller.
    pub fn send(&self, operation: ClusterOperation) -> Result<(), RemoteError> {
        let Some(ref tx) = self.command_tx else {
            return Err(RemoteError::ConnectionLost("Peer not started".to_string()));
        };
        tx.try_send(PeerCommand::Send(operation)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RemoteError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                RemoteError::ConnectionLost("Command channel closed".to_string())
            }
        })
    }

    /// Spawn the connection task and return the peer ready to use
    pub fn spawn(mut self, queue_capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        self.command_tx = Some(tx);

        let node_id = self.node_id.clone();
        let local_node_id = self.local_node_id.clone();
        let peer_addr = self.peer_addr;
        let status = self.status.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            Self::connection_loop(node_id, local_node_id, peer_addr, status, shutdown, rx).await;
        });

        Arc::new(self)
    }

    /// Close the link after everything already queued was written
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(ref tx) = self.command_tx {
            let _ = tx.send(PeerCommand::Shutdown).await;
        }
        info!("ClusterPeer '{}': Stopped", self.node_id);
    }

    /// Run the connection loop with reconnection
    async fn connection_loop(
        node_id: ClientId,
        local_node_id: ClientId,
        peer_addr: SocketAddr,
        status: Arc<RwLock<RemotePeerStatus>>,
        shutdown: Arc<AtomicBool>,
        mut command_rx: mpsc::Receiver<PeerCommand>,
    ) {
        let mut retry_interval = Duration::from_secs(1);
        let max_retry = Duration::from_secs(30);
        // Operation taken off the queue but not written when the link broke
        let mut unsent: Option<ClusterOperation> = None;

        loop {
            *status.write() = RemotePeerStatus::Connecting;
            debug!("ClusterPeer '{}': Connecting to {}", node_id, peer_addr);

            match Self::connect_and_run(
                &node_id,
                &local_node_id,
                peer_addr,
                &status,
                &mut command_rx,
                &mut unsent,
            )
            .await
            {
                Ok(()) => {
                    info!("ClusterPeer '{}': Disconnected gracefully", node_id);
                    *status.write() = RemotePeerStatus::Disconnected;
                    return;
                }
                Err(RemoteError::Rejected(reason)) => {
                    error!("ClusterPeer '{}': Rejected: {}", node_id, reason);
                    *status.write() = RemotePeerStatus::Failed;
                    return;
                }
                Err(e) => {
                    warn!("ClusterPeer '{}': Connection failed: {}", node_id, e);
                    *status.write() = RemotePeerStatus::Backoff;

                    debug!(
                        "ClusterPeer '{}': Reconnecting in {:?}",
                        node_id, retry_interval
                    );

                    tokio::time::sleep(retry_interval).await;
                    retry_interval = std::cmp::min(retry_interval * 2, max_retry);
                }
            }

            if shutdown.load(Ordering::Acquire) || command_rx.is_closed() {
                info!("ClusterPeer '{}': Shutdown requested", node_id);
                *status.write() = RemotePeerStatus::Disconnected;
                return;
            }
        }
    }

    /// Connect to the peer and run the message loop
    async fn connect_and_run(
        node_id: &ClientId,
        local_node_id: &ClientId,
        peer_addr: SocketAddr,
        status: &Arc<RwLock<RemotePeerStatus>>,
        command_rx: &mut mpsc::Receiver<PeerCommand>,
        unsent: &mut Option<ClusterOperation>,
    ) -> Result<(), RemoteError> {
        let stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(peer_addr))
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
        stream.set_nodelay(true).ok();

        debug!("ClusterPeer '{}': TCP connected", node_id);

        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FrameReader::new(read_half);

        let hello = ClusterMessage::Hello {
            node_id: local_node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_message(&mut write_half, &hello).await?;

        let reply = tokio::time::timeout(Duration::from_secs(10), frames.next())
            .await
            .map_err(|_| RemoteError::Timeout)??;

        match reply {
            Some(ClusterMessage::HelloAck {
                node_id: peer_id,
                version,
            }) => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RemoteError::Rejected(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                if peer_id != node_id.as_ref() {
                    return Err(RemoteError::Rejected(format!(
                        "Expected node '{}' at {}, found '{}'",
                        node_id, peer_addr, peer_id
                    )));
                }
                info!("ClusterPeer '{}': Connected", node_id);
            }
            Some(other) => {
                return Err(RemoteError::Other(format!(
                    "Expected HelloAck, got {}",
                    other.type_name()
                )));
            }
            None => return Err(RemoteError::ConnectionLost("Connection closed".to_string())),
        }

        *status.write() = RemotePeerStatus::Connected;

        if let Some(operation) = unsent.take() {
            let msg = ClusterMessage::Operation(operation);
            write_message(&mut write_half, &msg).await.inspect_err(|_| {
                if let ClusterMessage::Operation(ref operation) = msg {
                    *unsent = Some(operation.clone());
                }
            })?;
            debug!("ClusterPeer '{}': resent {}", node_id, msg.type_name());
        }

        let ping_interval = Duration::from_secs(15);
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.reset();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(PeerCommand::Send(operation)) => {
                            let msg = ClusterMessage::Operation(operation);
                            if let Err(e) = write_message(&mut write_half, &msg).await {
                                if let ClusterMessage::Operation(operation) = msg {
                                    *unsent = Some(operation);
                                }
                                return Err(e);
                            }
                        }
                        Some(PeerCommand::Shutdown) | None => {
                            let _ = write_message(&mut write_half, &ClusterMessage::Goodbye).await;
                            return Ok(());
                        }
                    }
                }

                // Only control frames travel back on our own link
                result = frames.next() => {
                    match result? {
                        Some(ClusterMessage::Ping) => {
                            write_message(&mut write_half, &ClusterMessage::Pong).await?;
                        }
                        Some(ClusterMessage::Pong) => {
                            debug!("ClusterPeer '{}': Pong received", node_id);
                        }
                        Some(ClusterMessage::Goodbye) => {
                            info!("ClusterPeer '{}': Received Goodbye", node_id);
                            return Err(RemoteError::ConnectionLost("Peer disconnected".to_string()));
                        }
                        Some(other) => {
                            warn!(
                                "ClusterPeer '{}': Unexpected {} on outbound link",
                                node_id,
                                other.type_name()
                            );
                        }
                        None => {
                            return Err(RemoteError::ConnectionLost("Connection closed".to_string()));
                        }
                    }
                }

                _ = ping_timer.tick() => {
                    write_message(&mut write_half, &ClusterMessage::Ping).await?;
                }
            }
        }
    }
}
