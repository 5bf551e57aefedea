//! TCP peer links
//!
//! Runs the listening server and the outbound dialer, performs the handshake
//! exchange, and owns the per-link reader/writer task pair. The first frame
//! in each direction on every link is a `handshake` carrying the sender's
//! hardware snapshot; anything else closes the link.
//!
//! All writes to a link are funneled through its writer task, so concurrent
//! senders (scheduler, executor replies) never interleave partial frames.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::hardware::{HardwareProbe, HardwareSnapshot};
use crate::protocol::{read_frame, write_frame, WireMessage};

use super::{PeerRecord, PeerSnapshot, PeerTable};

/// Default TCP peer port
pub const DEFAULT_PEER_PORT: u16 = 50001;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP port to listen on
    pub listen_port: u16,

    /// Timeout for establishing outbound connections
    pub connect_timeout: Duration,

    /// Timeout for the handshake frame in either direction
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PEER_PORT,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Events emitted to the node's dispatch loop
// ─────────────────────────────────────────────────────────────────

/// Events from peer links to the application
#[derive(Debug)]
pub enum PeerEvent {
    /// A handshake completed (inbound or outbound)
    Connected { hostname: String },

    /// A link closed or failed
    Disconnected { hostname: String, reason: String },

    /// A frame arrived on a live link
    Frame { from: String, message: WireMessage },
}

// ─────────────────────────────────────────────────────────────────
// Connection Manager
// ─────────────────────────────────────────────────────────────────

/// Manages TCP links to peers and the peer table
pub struct ConnectionManager {
    core: Arc<LinkCore>,
    listener_addr: RwLock<Option<SocketAddr>>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// State shared with the accept loop and every link task
struct LinkCore {
    config: ConnectionConfig,
    probe: Arc<HardwareProbe>,
    table: Arc<PeerTable>,
    event_tx: mpsc::Sender<PeerEvent>,
    next_link_id: AtomicU64,
}

impl ConnectionManager {
    /// Create a connection manager
    pub fn new(
        config: ConnectionConfig,
        probe: Arc<HardwareProbe>,
        table: Arc<PeerTable>,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            core: Arc::new(LinkCore {
                config,
                probe,
                table,
                event_tx,
                next_link_id: AtomicU64::new(1),
            }),
            listener_addr: RwLock::new(None),
            cancel: Mutex::new(None),
        }
    }

    /// Bind the peer port with address-reuse and start accepting
    /// connections. Returns the bound address.
    pub async fn start_server(&self) -> Result<SocketAddr> {
        {
            let cancel = self.cancel.lock();
            if cancel.is_some() {
                if let Some(addr) = *self.listener_addr.read() {
                    return Ok(addr);
                }
            }
        }

        let bind_addr: SocketAddr = format!("0.0.0.0:{}", self.core.config.listen_port)
            .parse()
            .map_err(|e| Error::Internal(format!("Bad listen address: {e}")))?;

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;
        let listener = socket.listen(64)?;
        let addr = listener.local_addr()?;

        *self.listener_addr.write() = Some(addr);
        info!(addr = %addr, "Peer server listening");

        let token = CancellationToken::new();
        let core = Arc::clone(&self.core);
        let accept_token = token.clone();
        tokio::spawn(async move {
            core.accept_loop(listener, accept_token).await;
        });
        *self.cancel.lock() = Some(token);

        Ok(addr)
    }

    /// The bound listener address, once the server has started
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        *self.listener_addr.read()
    }

    /// Dial a discovered node on the fabric's peer port and perform the
    /// handshake.
    ///
    /// Returns true on success. Any failure is logged and leaves no partial
    /// state behind.
    pub async fn connect_to_node(&self, hostname: &str, ip: IpAddr) -> bool {
        self.connect_to_addr(hostname, SocketAddr::new(ip, self.core.config.listen_port))
            .await
    }

    /// Dial a node at an explicit address and perform the handshake
    pub async fn connect_to_addr(&self, hostname: &str, addr: SocketAddr) -> bool {
        if self.core.table.is_connected(hostname) {
            return true;
        }

        match Arc::clone(&self.core).connect(hostname, addr).await {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %hostname, addr = %addr, error = %e, "Failed to connect to node");
                false
            }
        }
    }

    /// Queue a frame for a peer. Fails if no live link exists.
    pub async fn send(&self, hostname: &str, message: WireMessage) -> Result<()> {
        let sender = self
            .core
            .table
            .sender(hostname)
            .ok_or_else(|| Error::NotConnected(hostname.to_string()))?;
        sender
            .send(message)
            .await
            .map_err(|_| Error::ConnectionLost {
                peer: hostname.to_string(),
                message: "write queue closed".to_string(),
            })
    }

    /// Snapshot of every connected peer, keyed by hostname
    pub fn get_connected_nodes(&self) -> std::collections::HashMap<String, PeerSnapshot> {
        self.core.table.snapshot()
    }

    /// The shared peer table
    pub fn table(&self) -> &Arc<PeerTable> {
        &self.core.table
    }

    /// Stop accepting, close every link, and clear the table
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        self.core.table.clear();
        info!("Connection manager stopped");
    }
}

impl LinkCore {
    /// Accept incoming peer connections until cancelled
    async fn accept_loop(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(peer_addr = %peer_addr, "Incoming peer connection");
                        let core = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = core.handle_inbound(stream, peer_addr).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Inbound connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!("Peer accept loop stopped");
    }

    /// Handle one accepted socket: require a handshake, answer with ours,
    /// then install the link
    async fn handle_inbound(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let first = tokio::time::timeout(self.config.handshake_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::ConnectionTimeout {
                peer: peer_addr.to_string(),
            })??;

        let snapshot = match first {
            WireMessage::Handshake(snapshot) => snapshot,
            other => {
                return Err(Error::ProtocolUnexpected {
                    expected: "handshake".to_string(),
                    got: other.kind().to_string(),
                });
            }
        };
        let hostname = snapshot.hostname.clone();

        // Answer with our own hardware info before handing the stream to the
        // link tasks, so the first frame written is the handshake.
        let local = self.probe.system_info().await;
        write_frame(&mut stream, &WireMessage::Handshake(local)).await?;

        info!(peer = %hostname, addr = %peer_addr, "Peer connected (inbound)");
        self.install_link(hostname, peer_addr.ip(), peer_addr.port(), snapshot, stream);

        Ok(())
    }

    /// Dial, handshake, and install the link on success
    async fn connect(self: Arc<Self>, hostname: &str, addr: SocketAddr) -> Result<()> {
        let mut stream =
            tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::ConnectionTimeout {
                    peer: hostname.to_string(),
                })?
                .map_err(|e| Error::ConnectionFailed {
                    peer: hostname.to_string(),
                    message: e.to_string(),
                })?;

        let local = self.probe.system_info().await;
        write_frame(&mut stream, &WireMessage::Handshake(local)).await?;

        let reply = tokio::time::timeout(self.config.handshake_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::ConnectionTimeout {
                peer: hostname.to_string(),
            })??;

        let snapshot = match reply {
            WireMessage::Handshake(snapshot) => snapshot,
            other => {
                return Err(Error::ProtocolUnexpected {
                    expected: "handshake".to_string(),
                    got: other.kind().to_string(),
                });
            }
        };

        info!(peer = %hostname, addr = %addr, "Peer connected (outbound)");
        // The record is keyed by the hostname we dialed, not the one the
        // peer reported.
        self.install_link(hostname.to_string(), addr.ip(), addr.port(), snapshot, stream);

        Ok(())
    }

    /// Split the stream, spawn the reader/writer pair, and install the peer
    /// record
    fn install_link(
        self: Arc<Self>,
        hostname: String,
        ip: IpAddr,
        port: u16,
        hardware: HardwareSnapshot,
        stream: TcpStream,
    ) {
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let link_cancel = CancellationToken::new();
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel::<WireMessage>(64);

        self.table.insert(PeerRecord {
            hostname: hostname.clone(),
            ip,
            port,
            hardware,
            active: true,
            connected_at: Instant::now(),
            link_id,
            outbound,
            link_cancel: link_cancel.clone(),
        });

        let writer_peer = hostname.clone();
        let writer_cancel = link_cancel.clone();
        let writer_table = Arc::clone(&self.table);
        tokio::spawn(async move {
            write_loop(
                writer_peer,
                link_id,
                writer_table,
                write_half,
                outbound_rx,
                writer_cancel,
            )
            .await;
        });

        tokio::spawn(async move {
            self.read_loop(hostname, link_id, read_half, link_cancel).await;
        });
    }

    /// Consume inbound frames on one link until it fails or is cancelled
    async fn read_loop(
        self: Arc<Self>,
        hostname: String,
        link_id: u64,
        mut reader: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let _ = self
            .event_tx
            .send(PeerEvent::Connected {
                hostname: hostname.clone(),
            })
            .await;

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Replaced or shut down deliberately; the record is
                    // already gone.
                    debug!(peer = %hostname, "Peer link cancelled");
                    return;
                }
                frame = read_frame(&mut reader) => match frame {
                    Ok(WireMessage::Handshake(snapshot)) => {
                        // Telemetry refresh on an established link
                        self.table.update_hardware(&hostname, snapshot);
                    }
                    Ok(message) => {
                        let _ = self
                            .event_tx
                            .send(PeerEvent::Frame {
                                from: hostname.clone(),
                                message,
                            })
                            .await;
                    }
                    Err(e) => {
                        debug!(peer = %hostname, error = %e, "Peer read error");
                        break e.to_string();
                    }
                }
            }
        };

        self.table.deactivate_link(&hostname, link_id);
        if self.table.remove_link(&hostname, link_id) {
            cancel.cancel(); // stop the writer too
            let _ = self
                .event_tx
                .send(PeerEvent::Disconnected { hostname, reason })
                .await;
        }
    }
}

/// Background task: drain the outbound queue onto the socket
async fn write_loop(
    hostname: String,
    link_id: u64,
    table: Arc<PeerTable>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<WireMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            queued = outbound.recv() => match queued {
                Some(message) => {
                    if let Err(e) = write_frame(&mut writer, &message).await {
                        debug!(peer = %hostname, error = %e, "Peer write error");
                        table.deactivate_link(&hostname, link_id);
                        break;
                    }
                }
                None => break,
            }
        }
    }
    debug!(peer = %hostname, "Peer writer stopped");
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_manager(port: u16) -> (Arc<ConnectionManager>, mpsc::Receiver<PeerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let probe = Arc::new(
            HardwareProbe::new(format!("host-{port}"))
                .with_sample_window(Duration::from_millis(50)),
        );
        let manager = Arc::new(ConnectionManager::new(
            ConnectionConfig {
                listen_port: port,
                connect_timeout: Duration::from_secs(5),
                handshake_timeout: Duration::from_secs(5),
            },
            probe,
            Arc::new(PeerTable::new()),
            event_tx,
        ));
        (manager, event_rx)
    }

    #[tokio::test]
    async fn test_handshake_installs_both_records() {
        let (server, mut server_events) = test_manager(0);
        let addr = server.start_server().await.unwrap();

        let (client, mut client_events) = test_manager(addr.port());
        let connected = client.connect_to_node("server-host", addr.ip()).await;
        assert!(connected);

        // Client side: record keyed by the dialed hostname
        let peers = client.get_connected_nodes();
        let record = peers.get("server-host").expect("client record missing");
        assert!(record.active);
        assert!(record.hardware.cpu_count > 0);

        // Both sides observed the connection
        match client_events.recv().await.unwrap() {
            PeerEvent::Connected { hostname } => assert_eq!(hostname, "server-host"),
            other => panic!("Expected Connected, got {other:?}"),
        }
        match server_events.recv().await.unwrap() {
            PeerEvent::Connected { hostname } => {
                assert_eq!(hostname, format!("host-{}", addr.port()))
            }
            other => panic!("Expected Connected, got {other:?}"),
        }

        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_first_frame_must_be_handshake() {
        let (server, _events) = test_manager(0);
        let addr = server.start_server().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let poll = WireMessage::TaskStatus(crate::protocol::TaskStatusUpdate::poll("task_0"));
        write_frame(&mut stream, &poll).await.unwrap();

        // The server closes the socket without installing a record
        let result = read_frame(&mut stream).await;
        assert!(result.is_err());
        assert!(server.get_connected_nodes().is_empty());

        server.stop();
    }

    #[tokio::test]
    async fn test_connect_refused_returns_false() {
        let (client, _events) = test_manager(1); // nothing listens on port 1
        let connected = client
            .connect_to_node("ghost", "127.0.0.1".parse().unwrap())
            .await;
        assert!(!connected);
        assert!(client.get_connected_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_frames_flow_between_peers() {
        let (server, mut server_events) = test_manager(0);
        let addr = server.start_server().await.unwrap();

        let (client, _client_events) = test_manager(addr.port());
        assert!(client.connect_to_node("server-host", addr.ip()).await);

        client
            .send(
                "server-host",
                WireMessage::TaskStatus(crate::protocol::TaskStatusUpdate::poll("task_7")),
            )
            .await
            .unwrap();

        // Skip the Connected event, then expect the frame
        loop {
            match server_events.recv().await.unwrap() {
                PeerEvent::Frame { message, .. } => {
                    match message {
                        WireMessage::TaskStatus(update) => {
                            assert_eq!(update.task_id, "task_7");
                            assert!(update.status.is_none());
                        }
                        other => panic!("Expected task_status, got {}", other.kind()),
                    }
                    break;
                }
                PeerEvent::Connected { .. } => continue,
                other => panic!("Unexpected event {other:?}"),
            }
        }

        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_peer_death_emits_disconnected() {
        let (server, _server_events) = test_manager(0);
        let addr = server.start_server().await.unwrap();

        let (client, mut client_events) = test_manager(addr.port());
        assert!(client.connect_to_node("server-host", addr.ip()).await);

        // Drop every server-side link
        server.stop();

        let mut disconnected = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), client_events.recv()).await
        {
            if let PeerEvent::Disconnected { hostname, .. } = event {
                assert_eq!(hostname, "server-host");
                disconnected = true;
                break;
            }
        }
        assert!(disconnected, "client never observed the dropped link");
        assert!(client.get_connected_nodes().is_empty());

        client.stop();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (manager, _events) = test_manager(0);
        let err = manager
            .send(
                "nobody",
                WireMessage::TaskStatus(crate::protocol::TaskStatusUpdate::poll("task_0")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }
}
