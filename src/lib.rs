//! # Cooler HUD - CPU telemetry for a USB HID cooler display
//!
//! Samples host CPU performance counters once per second, encodes package
//! power, temperature, utilization and frequency into the fixed 20-byte
//! command frame the cooler's display understands, and writes it to the
//! peripheral over USB HID.
//!
//! ## Features
//!
//! - **Differential CPU sampling**: utilization and package power from two
//!   consecutive counter samples
//! - **Core metrics**: memory, storage and network throughput every tick
//! - **Slow hardware queries**: GPU identity/usage and RAM speed on their own
//!   cadence, never blocking the tick
//! - **Resilient delivery**: the pipeline keeps running while the display is
//!   absent and reconnects with backoff
//! - **Library + Binary**: subscribe to snapshots from your own code or run
//!   the bundled CLI
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cooler_hud::{MonitorConfig, Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut scheduler = Scheduler::new(MonitorConfig::default())?;
//!     let mut updates = scheduler.subscribe();
//!     scheduler.start()?;
//!
//!     updates.changed().await?;
//!     println!("{:?}", updates.borrow().cpu);
//!
//!     scheduler.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod fake;
pub mod metrics;
pub mod scheduler;

// Re-export public API
pub use config::MonitorConfig;
pub use device::{CommandFrame, DeviceManager, FrameEncoder};
pub use error::{Result, SystemError};
pub use metrics::{
    data::{CpuMetrics, DiskMetrics, GpuMetrics, MemoryMetrics, NetworkMetrics},
    HardwareInfo, HardwareProbe, MetricsAggregator, MetricsSnapshot, PerformanceSampler,
};
pub use scheduler::{Pipeline, Scheduler, SchedulerState};

/// The default sampling interval in milliseconds
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// USB vendor id of the cooler display
pub const DEFAULT_VENDOR_ID: u16 = 0x3633;

/// USB product id of the cooler display
pub const DEFAULT_PRODUCT_ID: u16 = 0x0012;
