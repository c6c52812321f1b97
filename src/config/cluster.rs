//! Cluster Configuration
//!
//! Membership of gossip-discovered service nodes, the peer links that carry
//! cluster operations, and the subscription handshake on startup.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

use crate::broker::SyncPolicy;

/// One `[[cluster]]` section
///
/// Intervals are humantime strings (`"1s"`, `"750ms"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,

    /// Address other members know this node by; hostname when unset
    pub node_id: Option<String>,

    /// UDP bind address for chitchat gossip
    pub gossip_addr: SocketAddr,

    /// Gossip address announced to other members
    pub gossip_advertise_addr: Option<SocketAddr>,

    /// TCP bind address for inbound peer links
    pub peer_addr: SocketAddr,

    /// Peer link address announced through gossip
    pub peer_advertise_addr: Option<SocketAddr>,

    /// Gossip addresses ("host:port") contacted on startup
    pub seeds: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// Silence after which the failure detector starts suspecting a member
    #[serde(with = "humantime_serde")]
    pub failure_timeout: Duration,

    /// How long a dead member's gossip state is kept before it is purged
    #[serde(with = "humantime_serde")]
    pub dead_node_grace_period: Duration,

    /// How long `start` waits for each member's subscription state
    #[serde(with = "humantime_serde")]
    pub subscription_sync_timeout: Duration,

    /// Extra subscription requests sent to a member that stays silent
    pub subscription_sync_retries: u32,

    /// Operations queued per peer link before sends fail
    pub peer_queue_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            gossip_addr: SocketAddr::from(([0, 0, 0, 0], 7946)),
            gossip_advertise_addr: None,
            peer_addr: SocketAddr::from(([0, 0, 0, 0], 7947)),
            peer_advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(5),
            dead_node_grace_period: Duration::from_secs(30),
            subscription_sync_timeout: Duration::from_secs(5),
            subscription_sync_retries: 1,
            peer_queue_capacity: 1000,
        }
    }
}

impl ClusterConfig {
    /// Configured node id, else the hostname, else a per-process name
    pub fn resolve_node_id(&self) -> String {
        if let Some(ref id) = self.node_id {
            return id.clone();
        }
        match hostname::get() {
            Ok(host) => host.to_string_lossy().into_owned(),
            Err(_) => format!("vibebus-{}", std::process::id()),
        }
    }

    pub fn advertised_gossip_addr(&self) -> SocketAddr {
        advertise(self.gossip_advertise_addr, self.gossip_addr)
    }

    pub fn advertised_peer_addr(&self) -> SocketAddr {
        advertise(self.peer_advertise_addr, self.peer_addr)
    }

    /// Startup subscription handshake policy
    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            timeout: self.subscription_sync_timeout,
            retries: self.subscription_sync_retries,
        }
    }
}

/// Explicit address first, then the bind port on the host's own IPv4
/// address, then the bind address itself
fn advertise(explicit: Option<SocketAddr>, bind: SocketAddr) -> SocketAddr {
    if let Some(addr) = explicit {
        return addr;
    }
    if !bind.ip().is_unspecified() {
        return bind;
    }
    match local_ipv4() {
        Some(ip) => SocketAddr::new(ip, bind.port()),
        None => bind,
    }
}

fn local_ipv4() -> Option<IpAddr> {
    let host = hostname::get().ok()?;
    format!("{}:0", host.to_string_lossy())
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}
