//! Hardware probing
//!
//! Samples local CPU, memory, and disk usage and answers the admission
//! question "can this host absorb N% CPU and M% memory more?". CPU sampling
//! blocks for one sampling window, so both operations are suspension points
//! for their callers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::debug;

// ─────────────────────────────────────────────────────────────────
// Hardware Snapshot
// ─────────────────────────────────────────────────────────────────

/// A point-in-time view of a host's resources.
///
/// This is the payload of every `handshake` frame, so its field names are
/// part of the wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    /// Number of logical CPUs
    pub cpu_count: usize,

    /// CPU usage over the sampling window, 0-100
    pub cpu_percent: f32,

    /// Memory usage, 0-100
    #[serde(default)]
    pub memory_percent: f32,

    /// Disk usage of the root filesystem, 0-100
    #[serde(default)]
    pub disk_percent: f32,

    /// Total physical memory in bytes
    pub memory_total: u64,

    /// Available memory in bytes
    pub memory_available: u64,

    /// Total root filesystem capacity in bytes
    pub disk_total: u64,

    /// Free root filesystem capacity in bytes
    pub disk_free: u64,

    /// Operating system family (e.g. "linux")
    pub system: String,

    /// CPU architecture (e.g. "x86_64")
    pub machine: String,

    /// CPU model string
    pub processor: String,

    /// The reporting host's name; the peer-table key after handshake
    pub hostname: String,
}

// ─────────────────────────────────────────────────────────────────
// Hardware Probe
// ─────────────────────────────────────────────────────────────────

/// Default CPU sampling window
const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Samples local hardware state on demand.
///
/// No caching: every call re-samples, and the cost is bounded by one
/// sampling window.
pub struct HardwareProbe {
    hostname: String,
    sample_window: Duration,
}

impl HardwareProbe {
    /// Create a probe reporting under the given hostname
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            sample_window: SAMPLE_WINDOW,
        }
    }

    /// Override the CPU sampling window
    pub fn with_sample_window(mut self, window: Duration) -> Self {
        self.sample_window = window;
        self
    }

    /// The hostname this probe reports under
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Take a fresh hardware snapshot.
    ///
    /// Suspends for one sampling window while measuring CPU usage.
    pub async fn system_info(&self) -> HardwareSnapshot {
        let mut sys = System::new();
        let (cpu_percent, processor) = self.sample(&mut sys).await;

        let memory_total = sys.total_memory();
        let memory_available = sys.available_memory();
        let memory_percent = percent_used(memory_total, memory_available);

        let (disk_total, disk_free) = root_disk_usage();
        let disk_percent = percent_used(disk_total, disk_free);

        HardwareSnapshot {
            cpu_count: num_cpus::get(),
            cpu_percent,
            memory_percent,
            disk_percent,
            memory_total,
            memory_available,
            disk_total,
            disk_free,
            system: std::env::consts::OS.to_string(),
            machine: std::env::consts::ARCH.to_string(),
            processor,
            hostname: self.hostname.clone(),
        }
    }

    /// Check whether this host can absorb the requested headroom.
    ///
    /// True iff a freshly sampled CPU usage plus `required_cpu` stays within
    /// 100% and current memory usage plus `required_memory` does too. This is
    /// an instantaneous check, not a reservation.
    pub async fn resource_available(&self, required_cpu: f32, required_memory: f32) -> bool {
        let mut sys = System::new();
        let (cpu_percent, _) = self.sample(&mut sys).await;
        let memory_percent = percent_used(sys.total_memory(), sys.available_memory());

        let available =
            cpu_percent + required_cpu <= 100.0 && memory_percent + required_memory <= 100.0;

        debug!(
            cpu_percent,
            memory_percent, required_cpu, required_memory, available, "Resource check"
        );

        available
    }

    /// Sample CPU usage over one window and refresh memory counters
    async fn sample(&self, sys: &mut System) -> (f32, String) {
        sys.refresh_cpu_usage();
        tokio::time::sleep(self.sample_window).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_usage().clamp(0.0, 100.0);
        let processor = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_default();

        (cpu_percent, processor)
    }
}

/// Percent of a capacity in use, given the free amount
fn percent_used(total: u64, free: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (total.saturating_sub(free) as f64 / total as f64 * 100.0) as f32
}

/// Total and free bytes of the filesystem mounted at `/`, falling back to
/// the first listed disk
fn root_disk_usage() -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.list().first());

    match root {
        Some(disk) => (disk.total_space(), disk.available_space()),
        None => (0, 0),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
