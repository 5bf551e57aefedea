//! UDP broadcast discovery
//!
//! Two background tasks make peers findable on the local segment:
//!
//! 1. **Broadcaster** — every `broadcast_interval` sends one
//!    `{"hostname": "<local-hostname>"}` datagram to the IPv4 limited
//!    broadcast address on the discovery port.
//!
//! 2. **Listener** — reads datagrams on the same port and maintains the
//!    (hostname, ip) discovery set. Datagrams carrying the local hostname
//!    and datagrams that fail to parse are dropped.
//!
//! Discovery provides no delivery or liveness guarantees; a missing
//! broadcast does not imply a dead peer.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default UDP discovery port
pub const DEFAULT_DISCOVERY_PORT: u16 = 50000;

/// Default seconds between presence broadcasts
pub const DEFAULT_BROADCAST_INTERVAL_SECS: u64 = 5;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Discovery service configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to broadcast and listen on
    pub port: u16,

    /// Interval between presence broadcasts
    pub broadcast_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_interval: Duration::from_secs(DEFAULT_BROADCAST_INTERVAL_SECS),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Beacon payload
// ─────────────────────────────────────────────────────────────────

/// Discovery datagram payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Beacon {
    hostname: String,
}

// ─────────────────────────────────────────────────────────────────
// Discovery Service
// ─────────────────────────────────────────────────────────────────

/// Shared discovery set, updated by the listener
type NodeSet = Arc<RwLock<HashSet<(String, IpAddr)>>>;

/// Maintains the set of (hostname, ip) pairs seen on the local segment
pub struct DiscoveryService {
    config: DiscoveryConfig,
    hostname: String,
    nodes: NodeSet,
    cancel: Mutex<Option<CancellationToken>>,
}

impl DiscoveryService {
    /// Create a discovery service announcing the given hostname
    pub fn new(config: DiscoveryConfig, hostname: impl Into<String>) -> Self {
        Self {
            config,
            hostname: hostname.into(),
            nodes: Arc::new(RwLock::new(HashSet::new())),
            cancel: Mutex::new(None),
        }
    }

    /// Start broadcasting and listening. Idempotent and non-blocking.
    ///
    /// The listener socket is bound before any task is spawned so bind
    /// failures surface to the caller.
    pub fn start(&self) -> Result<()> {
        let mut cancel = self.cancel.lock();
        if cancel.is_some() {
            return Ok(());
        }

        let listener = bind_reusable_udp(self.config.port)?;
        let token = CancellationToken::new();

        let nodes = Arc::clone(&self.nodes);
        let local_hostname = self.hostname.clone();
        let listen_token = token.clone();
        tokio::spawn(async move {
            listen_loop(listener, nodes, local_hostname, listen_token).await;
        });

        let hostname = self.hostname.clone();
        let port = self.config.port;
        let broadcast_interval = self.config.broadcast_interval;
        let broadcast_token = token.clone();
        tokio::spawn(async move {
            broadcast_loop(hostname, port, broadcast_interval, broadcast_token).await;
        });

        *cancel = Some(token);
        info!(port = self.config.port, "Discovery service started");
        Ok(())
    }

    /// Halt both loops. In-flight sends and receives are discarded.
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
            info!("Discovery service stopped");
        }
    }

    /// Snapshot of the current discovery set
    pub fn get_nodes(&self) -> HashSet<(String, IpAddr)> {
        self.nodes.read().clone()
    }

    /// The hostname this service announces
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

/// Background task: periodically announce our presence on the segment
async fn broadcast_loop(
    hostname: String,
    port: u16,
    broadcast_interval: Duration,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Discovery broadcaster bind failed");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!(error = %e, "Discovery broadcaster set_broadcast failed");
        return;
    }

    let payload = match serde_json::to_vec(&Beacon { hostname }) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "Discovery beacon encode failed");
            return;
        }
    };
    let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, port);

    let mut tick = interval(broadcast_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    warn!(error = %e, "Discovery broadcast failed");
                }
            }
        }
    }
    debug!("Discovery broadcaster stopped");
}

/// Background task: collect presence datagrams from other nodes
async fn listen_loop(
    socket: UdpSocket,
    nodes: NodeSet,
    local_hostname: String,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => record_datagram(&nodes, &local_hostname, &buf[..len], src.ip()),
                    Err(e) => warn!(error = %e, "Discovery recv error"),
                }
            }
        }
    }
    debug!("Discovery listener stopped");
}

/// Record one presence datagram; malformed payloads and our own
/// announcements are dropped
fn record_datagram(nodes: &NodeSet, local_hostname: &str, data: &[u8], src: IpAddr) {
    let beacon: Beacon = match serde_json::from_slice(data) {
        Ok(b) => b,
        Err(e) => {
            debug!(error = %e, src = %src, "Ignoring malformed discovery datagram");
            return;
        }
    };

    if beacon.hostname == local_hostname {
        return;
    }

    let newly_seen = nodes.write().insert((beacon.hostname.clone(), src));
    if newly_seen {
        info!(hostname = %beacon.hostname, ip = %src, "Discovered node");
    }
}

/// Bind the discovery port with SO_REUSEADDR (and SO_REUSEPORT where
/// available) so several nodes can share it on one machine.
fn bind_reusable_udp(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&socket2::SockAddr::from(addr))
        .map_err(|e| Error::Config(format!("Failed to bind discovery port {}: {}", port, e)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
