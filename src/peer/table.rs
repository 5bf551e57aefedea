//! Peer table — live peer links and their latest telemetry
//!
//! Keyed by hostname; a hostname appears at most once. Iteration order for
//! scheduling is insertion order, so the table keeps an explicit order list
//! next to the map. A replacement keeps the original position, matching the
//! behavior of an ordered map.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hardware::HardwareSnapshot;
use crate::protocol::WireMessage;

// ─────────────────────────────────────────────────────────────────
// Peer records
// ─────────────────────────────────────────────────────────────────

/// A live peer link and its cached state
pub struct PeerRecord {
    /// Post-handshake peer identity and table key
    pub hostname: String,

    /// Remote address observed at connection time
    pub ip: IpAddr,

    /// Remote port of the link
    pub port: u16,

    /// Last hardware snapshot received from this peer
    pub hardware: HardwareSnapshot,

    /// Cleared when a read or write on the link fails
    pub active: bool,

    /// When the link was established
    pub connected_at: Instant,

    /// Identifies which link task pair owns this record
    pub(crate) link_id: u64,

    /// Queue feeding the link's writer task
    pub(crate) outbound: mpsc::Sender<WireMessage>,

    /// Cancels the link's reader/writer tasks
    pub(crate) link_cancel: CancellationToken,
}

/// Public view of a peer record, returned by snapshots
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
    pub hardware: HardwareSnapshot,
    pub active: bool,
}

impl PeerRecord {
    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            hostname: self.hostname.clone(),
            ip: self.ip,
            port: self.port,
            hardware: self.hardware.clone(),
            active: self.active,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Peer Table
// ─────────────────────────────────────────────────────────────────

struct Inner {
    peers: HashMap<String, PeerRecord>,
    order: Vec<String>,
}

/// Thread-safe table of live peers
pub struct PeerTable {
    inner: RwLock<Inner>,
}

impl PeerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Install a peer record.
    ///
    /// A second handshake from the same hostname replaces the old record;
    /// the replaced link's tasks are cancelled (closing its transport) and
    /// the hostname keeps its original scheduling position.
    pub fn insert(&self, record: PeerRecord) {
        let mut inner = self.inner.write();
        let hostname = record.hostname.clone();
        if let Some(old) = inner.peers.insert(hostname.clone(), record) {
            old.link_cancel.cancel();
        } else {
            inner.order.push(hostname);
        }
    }

    /// Remove a peer, but only if the given link still owns the record.
    ///
    /// The link-id guard keeps a dying replaced link from tearing down its
    /// successor's record.
    pub(crate) fn remove_link(&self, hostname: &str, link_id: u64) -> bool {
        let mut inner = self.inner.write();
        match inner.peers.get(hostname) {
            Some(record) if record.link_id == link_id => {
                inner.peers.remove(hostname);
                inner.order.retain(|h| h != hostname);
                true
            }
            _ => false,
        }
    }

    /// Clear a peer's liveness flag without removing the record, but only
    /// if the given link still owns it
    pub(crate) fn deactivate_link(&self, hostname: &str, link_id: u64) {
        if let Some(record) = self.inner.write().peers.get_mut(hostname) {
            if record.link_id == link_id {
                record.active = false;
            }
        }
    }

    /// Refresh a peer's cached hardware snapshot
    pub fn update_hardware(&self, hostname: &str, hardware: HardwareSnapshot) {
        if let Some(record) = self.inner.write().peers.get_mut(hostname) {
            record.hardware = hardware;
        }
    }

    /// Get a snapshot of one peer
    pub fn get(&self, hostname: &str) -> Option<PeerSnapshot> {
        self.inner.read().peers.get(hostname).map(|r| r.snapshot())
    }

    /// Whether a live link to the hostname exists
    pub fn is_connected(&self, hostname: &str) -> bool {
        self.inner
            .read()
            .peers
            .get(hostname)
            .map(|r| r.active)
            .unwrap_or(false)
    }

    /// Snapshot of every peer, keyed by hostname
    pub fn snapshot(&self) -> HashMap<String, PeerSnapshot> {
        self.inner
            .read()
            .peers
            .iter()
            .map(|(k, v)| (k.clone(), v.snapshot()))
            .collect()
    }

    /// Snapshots in insertion order, for first-fit scheduling
    pub fn in_order(&self) -> Vec<PeerSnapshot> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|h| inner.peers.get(h))
            .map(|r| r.snapshot())
            .collect()
    }

    /// The writer queue for a peer's link, if the peer is live
    pub(crate) fn sender(&self, hostname: &str) -> Option<mpsc::Sender<WireMessage>> {
        let inner = self.inner.read();
        inner
            .peers
            .get(hostname)
            .filter(|r| r.active)
            .map(|r| r.outbound.clone())
    }

    /// Number of peers in the table
    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    /// Cancel every link and clear the table
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        for record in inner.peers.values() {
            record.link_cancel.cancel();
        }
        inner.peers.clear();
        inner.order.clear();
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_snapshot(hostname: &str) -> HardwareSnapshot {
        HardwareSnapshot {
            cpu_count: 8,
            cpu_percent: 10.0,
            memory_percent: 40.0,
            disk_percent: 50.0,
            memory_total: 16 << 30,
            memory_available: 8 << 30,
            disk_total: 512 << 30,
            disk_free: 256 << 30,
            system: "linux".to_string(),
            machine: "x86_64".to_string(),
            processor: "test".to_string(),
            hostname: hostname.to_string(),
        }
    }

    fn test_record(hostname: &str, link_id: u64) -> PeerRecord {
        let (outbound, _rx) = mpsc::channel(4);
        PeerRecord {
            hostname: hostname.to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            port: 50001,
            hardware: test_snapshot(hostname),
            active: true,
            connected_at: Instant::now(),
            link_id,
            outbound,
            link_cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let table = PeerTable::new();
        table.insert(test_record("node-a", 1));

        assert_eq!(table.len(), 1);
        let peer = table.get("node-a").unwrap();
        assert_eq!(peer.hostname, "node-a");
        assert!(peer.active);
    }

    #[test]
    fn test_hostname_unique_after_replacement() {
        let table = PeerTable::new();
        let first = test_record("node-a", 1);
        let first_cancel = first.link_cancel.clone();
        table.insert(first);
        table.insert(test_record("node-a", 2));

        assert_eq!(table.len(), 1);
        // Replacement closed the old transport
        assert!(first_cancel.is_cancelled());
    }

    #[test]
    fn test_insertion_order_preserved() {
        let table = PeerTable::new();
        table.insert(test_record("node-a", 1));
        table.insert(test_record("node-b", 2));
        table.insert(test_record("node-c", 3));
        // Replacing an existing peer keeps its position
        table.insert(test_record("node-a", 4));

        let order: Vec<String> = table.in_order().into_iter().map(|p| p.hostname).collect();
        assert_eq!(order, vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn test_remove_link_guard() {
        let table = PeerTable::new();
        table.insert(test_record("node-a", 1));
        table.insert(test_record("node-a", 2));

        // The replaced link may not remove its successor's record
        assert!(!table.remove_link("node-a", 1));
        assert_eq!(table.len(), 1);

        assert!(table.remove_link("node-a", 2));
        assert!(table.is_empty());
    }

    #[test]
    fn test_deactivate_hides_sender() {
        let table = PeerTable::new();
        table.insert(test_record("node-a", 1));
        assert!(table.sender("node-a").is_some());

        // Wrong link id leaves the record alone
        table.deactivate_link("node-a", 99);
        assert!(table.is_connected("node-a"));

        table.deactivate_link("node-a", 1);
        assert!(table.sender("node-a").is_none());
        assert!(!table.is_connected("node-a"));
        // Record still present for snapshots
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_update_hardware() {
        let table = PeerTable::new();
        table.insert(test_record("node-a", 1));

        let mut refreshed = test_snapshot("node-a");
        refreshed.cpu_percent = 95.0;
        table.update_hardware("node-a", refreshed);

        assert_eq!(table.get("node-a").unwrap().hardware.cpu_percent, 95.0);
    }

    #[test]
    fn test_clear_cancels_links() {
        let table = PeerTable::new();
        let record = test_record("node-a", 1);
        let cancel = record.link_cancel.clone();
        table.insert(record);

        table.clear();
        assert!(table.is_empty());
        assert!(cancel.is_cancelled());
    }
}
