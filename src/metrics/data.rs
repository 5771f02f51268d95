//! Data structures for published metrics.

use serde::{Deserialize, Serialize};

/// Placeholder shown until the GPU model has been resolved.
pub const UNKNOWN_MODEL: &str = "unknown";

/// The latest published view of the host at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Timestamp when this snapshot was taken (Unix timestamp in milliseconds)
    pub timestamp: u64,
    /// Processor metrics derived from the performance sampler
    pub cpu: CpuMetrics,
    /// Memory usage and module frequency
    pub memory: MemoryMetrics,
    /// Filesystem usage for the configured mount point
    pub disk: DiskMetrics,
    /// Cumulative interface counters and derived rates
    pub network: NetworkMetrics,
    /// Graphics adapter identity and usage
    pub gpu: GpuMetrics,
    /// Whether the display peripheral accepted the last frame
    pub device_connected: bool,
}

/// Processor metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// CPU model name
    pub model: String,
    /// Number of logical CPUs
    pub core_count: u32,
    /// Utilization over the last tick (0.0 to 100.0)
    pub utilization_percent: f64,
    /// Average current core frequency in MHz
    pub frequency_mhz: f64,
    /// Hottest package/core sensor in Celsius
    pub package_temp_c: f64,
    /// Package power over the last tick in watts
    pub package_power_w: f64,
}

/// Memory usage information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub used_bytes: u64,
    pub total_bytes: u64,
    /// Memory module frequency in MHz (0 until resolved)
    pub frequency_mhz: f64,
}

/// Filesystem usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub mount_point: String,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Network counters summed over all interfaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// Cumulative bytes transmitted
    pub sent_bytes: u64,
    /// Cumulative bytes received
    pub received_bytes: u64,
    /// Upload rate in bytes per second
    pub upload_bps: f64,
    /// Download rate in bytes per second
    pub download_bps: f64,
}

/// Graphics adapter information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuMetrics {
    pub model: String,
    pub vram_gb: f64,
    pub usage_percent: f64,
}

/// Results of the expensive hardware queries.
///
/// Every field is optional: a query that has not completed, or failed, leaves
/// the corresponding snapshot field untouched when merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub gpu_model: Option<String>,
    pub gpu_vram_gb: Option<f64>,
    pub gpu_usage_percent: Option<f64>,
    pub ram_frequency_mhz: Option<f64>,
}

impl MetricsSnapshot {
    /// Create an empty snapshot with the current timestamp.
    pub fn new() -> Self {
        Self {
            timestamp: now_millis(),
            cpu: CpuMetrics::default(),
            memory: MemoryMetrics::default(),
            disk: DiskMetrics::default(),
            network: NetworkMetrics::default(),
            gpu: GpuMetrics::default(),
            device_connected: false,
        }
    }

    /// Refresh the timestamp, keeping every other field.
    pub fn touch(&mut self) {
        self.timestamp = now_millis();
    }
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetrics {
    /// Build memory metrics, clamping `used` to `total`.
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used_bytes: used_bytes.min(total_bytes),
            total_bytes,
            frequency_mhz: 0.0,
        }
    }

    pub fn usage_percent(&self) -> f64 {
        percent_of(self.used_bytes, self.total_bytes)
    }
}

impl DiskMetrics {
    /// Build disk metrics, clamping `used` to `total`.
    pub fn new(mount_point: impl Into<String>, used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            mount_point: mount_point.into(),
            used_bytes: used_bytes.min(total_bytes),
            total_bytes,
        }
    }

    pub fn usage_percent(&self) -> f64 {
        percent_of(self.used_bytes, self.total_bytes)
    }
}

impl Default for GpuMetrics {
    fn default() -> Self {
        Self {
            model: UNKNOWN_MODEL.to_string(),
            vram_gb: 0.0,
            usage_percent: 0.0,
        }
    }
}

impl HardwareInfo {
    /// Copy every resolved field into `snapshot`.
    pub fn apply_to(&self, snapshot: &mut MetricsSnapshot) {
        if let Some(model) = &self.gpu_model {
            snapshot.gpu.model.clone_from(model);
        }
        if let Some(vram) = self.gpu_vram_gb {
            snapshot.gpu.vram_gb = vram.max(0.0);
        }
        if let Some(usage) = self.gpu_usage_percent {
            snapshot.gpu.usage_percent = usage.clamp(0.0, 100.0);
        }
        if let Some(freq) = self.ram_frequency_mhz {
            snapshot.memory.frequency_mhz = freq.max(0.0);
        }
    }
}

fn percent_of(used: u64, total: u64) -> f64 {
    if total > 0 {
        (used as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
