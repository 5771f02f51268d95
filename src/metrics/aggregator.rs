//! Cheap per-tick host metrics: memory, filesystem and network throughput.

use crate::metrics::data::{DiskMetrics, MemoryMetrics, NetworkMetrics};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use sysinfo::{Disks, Networks, System};
use tracing::debug;

/// Everything `poll_core` refreshes on a tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreMetrics {
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
}

/// Page-category breakdown of physical memory, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    pub active: u64,
    pub inactive: u64,
    pub wired: u64,
    pub compressed: u64,
    pub free: u64,
}

impl MemoryCounters {
    pub fn used(&self) -> u64 {
        self.active
            .saturating_add(self.inactive)
            .saturating_add(self.wired)
            .saturating_add(self.compressed)
    }

    pub fn total(&self) -> u64 {
        self.used().saturating_add(self.free)
    }
}

/// Turns cumulative byte counters into per-second rates.
#[derive(Debug, Default)]
pub struct ThroughputTracker {
    previous: Option<(u64, u64, Instant)>,
}

impl ThroughputTracker {
    /// Record new counters and return `(upload_bps, download_bps)`.
    ///
    /// The first call only sets the baseline and reports zero. A counter that
    /// went backwards is treated as a rebase and also reports zero.
    pub fn update(&mut self, sent: u64, received: u64, now: Instant) -> (f64, f64) {
        let rates = match self.previous {
            Some((prev_sent, prev_received, prev_at)) => {
                let elapsed = now.saturating_duration_since(prev_at).as_secs_f64();
                if elapsed > 0.0 {
                    (
                        sent.saturating_sub(prev_sent) as f64 / elapsed,
                        received.saturating_sub(prev_received) as f64 / elapsed,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };
        self.previous = Some((sent, received, now));
        rates
    }
}

/// Polls OS memory, filesystem and network counters.
pub struct MetricsAggregator {
    system: System,
    disks: Disks,
    networks: Networks,
    mount_point: PathBuf,
    meminfo_path: PathBuf,
    throughput: ThroughputTracker,
}

impl MetricsAggregator {
    /// Create an aggregator reporting disk usage for `mount_point`.
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            mount_point: mount_point.into(),
            meminfo_path: PathBuf::from("/proc/meminfo"),
            throughput: ThroughputTracker::default(),
        }
    }

    /// Read memory counters from an alternate `meminfo` file.
    pub fn with_meminfo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.meminfo_path = path.into();
        self
    }

    /// CPU brand string and logical CPU count.
    pub fn cpu_identity(&mut self) -> (String, u32) {
        self.system.refresh_cpu_all();
        let cpus = self.system.cpus();
        let model = cpus
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        (model, cpus.len() as u32)
    }

    /// Refresh memory, disk and network counters.
    pub fn poll_core(&mut self) -> CoreMetrics {
        self.disks.refresh();
        self.networks.refresh();

        let memory = self.collect_memory();
        let disk = self.collect_disk();
        let network = self.collect_network(Instant::now());

        CoreMetrics {
            memory,
            disk,
            network,
        }
    }

    fn collect_memory(&mut self) -> MemoryMetrics {
        if let Some(counters) = fs::read_to_string(&self.meminfo_path)
            .ok()
            .and_then(|content| parse_meminfo(&content))
        {
            return MemoryMetrics::new(counters.used(), counters.total());
        }

        self.system.refresh_memory();
        MemoryMetrics::new(self.system.used_memory(), self.system.total_memory())
    }

    fn collect_disk(&self) -> DiskMetrics {
        let mounts = self
            .disks
            .iter()
            .map(|disk| (disk.mount_point(), disk.total_space(), disk.available_space()));

        match select_mount(mounts, &self.mount_point) {
            Some((mount, total, available)) => DiskMetrics::new(
                mount.to_string_lossy(),
                total.saturating_sub(available),
                total,
            ),
            None => {
                debug!(
                    "No filesystem mounted at or above {}",
                    self.mount_point.display()
                );
                DiskMetrics::new(self.mount_point.to_string_lossy(), 0, 0)
            }
        }
    }

    fn collect_network(&mut self, now: Instant) -> NetworkMetrics {
        let (sent_bytes, received_bytes) =
            self.networks
                .iter()
                .fold((0u64, 0u64), |(sent, received), (_, data)| {
                    (
                        sent.saturating_add(data.total_transmitted()),
                        received.saturating_add(data.total_received()),
                    )
                });

        let (upload_bps, download_bps) = self.throughput.update(sent_bytes, received_bytes, now);
        NetworkMetrics {
            sent_bytes,
            received_bytes,
            upload_bps,
            download_bps,
        }
    }
}

/// Parse `/proc/meminfo` into page categories.
///
/// `Unevictable` stands in for wired memory and `Zswap` for compressed
/// memory; both default to zero on kernels that do not report them.
pub(crate) fn parse_meminfo(content: &str) -> Option<MemoryCounters> {
    let mut counters = MemoryCounters::default();
    let mut seen_active = false;
    let mut seen_free = false;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Some(kb) = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        let bytes = kb.saturating_mul(1024);
        match key.trim() {
            "Active" => {
                counters.active = bytes;
                seen_active = true;
            }
            "Inactive" => counters.inactive = bytes,
            "Unevictable" => counters.wired = bytes,
            "Zswap" => counters.compressed = bytes,
            "MemFree" => {
                counters.free = bytes;
                seen_free = true;
            }
            _ => {}
        }
    }

    (seen_active && seen_free).then_some(counters)
}

/// Pick the deepest mount point that contains `target`.
pub(crate) fn select_mount<'a, I>(mounts: I, target: &Path) -> Option<(&'a Path, u64, u64)>
where
    I: IntoIterator<Item = (&'a Path, u64, u64)>,
{
    mounts
        .into_iter()
        .filter(|(mount, _, _)| target.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_update_reports_zero() {
        let mut tracker = ThroughputTracker::default();
        assert_eq!(tracker.update(5_000, 9_000, Instant::now()), (0.0, 0.0));
    }

    #[test]
    fn test_rates_over_elapsed_time() {
        let t0 = Instant::now();
        let mut tracker = ThroughputTracker::default();
        tracker.update(1_000, 2_000, t0);
        let (up, down) = tracker.update(3_000, 6_000, t0 + Duration::from_secs(2));
        assert_eq!(up, 1_000.0);
        assert_eq!(down, 2_000.0);
    }

    #[test]
    fn test_counter_reset_is_rebase_not_negative() {
        let t0 = Instant::now();
        let mut tracker = ThroughputTracker::default();
        tracker.update(50_000, 50_000, t0);
        let (up, down) = tracker.update(100, 60_000, t0 + Duration::from_secs(1));
        assert_eq!(up, 0.0);
        assert_eq!(down, 10_000.0);

        // the reset value becomes the new baseline
        let (up, _) = tracker.update(1_100, 60_000, t0 + Duration::from_secs(2));
        assert_eq!(up, 1_000.0);
    }

    #[test]
    fn test_zero_elapsed_reports_zero() {
        let t0 = Instant::now();
        let mut tracker = ThroughputTracker::default();
        tracker.update(0, 0, t0);
        assert_eq!(tracker.update(10, 10, t0), (0.0, 0.0));
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "\
MemTotal:       16384000 kB
MemFree:         2000000 kB
MemAvailable:    8000000 kB
Active:          6000000 kB
Inactive:        4000000 kB
Unevictable:       10000 kB
Zswap:              5000 kB
";
        let counters = parse_meminfo(content).unwrap();
        assert_eq!(counters.active, 6_000_000 * 1024);
        assert_eq!(counters.used(), (6_000_000 + 4_000_000 + 10_000 + 5_000) * 1024);
        assert_eq!(counters.total(), counters.used() + 2_000_000 * 1024);
    }

    #[test]
    fn test_parse_meminfo_requires_core_fields() {
        assert_eq!(parse_meminfo("Inactive: 10 kB\n"), None);
        assert_eq!(parse_meminfo(""), None);
    }

    #[test]
    fn test_select_mount_prefers_deepest_match() {
        let mounts = vec![
            (Path::new("/"), 100, 40),
            (Path::new("/home"), 500, 100),
            (Path::new("/boot"), 1, 1),
        ];
        let (mount, total, _) = select_mount(mounts.clone(), Path::new("/home/user")).unwrap();
        assert_eq!(mount, Path::new("/home"));
        assert_eq!(total, 500);

        let (mount, _, _) = select_mount(mounts, Path::new("/")).unwrap();
        assert_eq!(mount, Path::new("/"));
    }

    #[test]
    fn test_poll_core_first_tick_has_zero_rates() {
        let mut aggregator = MetricsAggregator::new("/");
        let metrics = aggregator.poll_core();
        assert_eq!(metrics.network.upload_bps, 0.0);
        assert_eq!(metrics.network.download_bps, 0.0);
        assert!(metrics.memory.used_bytes <= metrics.memory.total_bytes);
        assert!(metrics.disk.used_bytes <= metrics.disk.total_bytes);
    }

    #[test]
    fn test_meminfo_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meminfo");
        fs::write(&path, "MemFree: 1 kB\nActive: 3 kB\n").unwrap();

        let mut aggregator = MetricsAggregator::new("/").with_meminfo_path(&path);
        let metrics = aggregator.poll_core();
        assert_eq!(metrics.memory.used_bytes, 3 * 1024);
        assert_eq!(metrics.memory.total_bytes, 4 * 1024);
    }
}
