//! Host metrics collection and data structures.
//!
//! This module samples CPU performance counters, polls memory, storage and
//! network statistics every tick, and runs the slower GPU/RAM identity
//! queries on their own cadence.

pub mod aggregator;
pub mod data;
pub mod probe;
pub mod sampler;
pub mod traits;

// Re-export commonly used items
pub use aggregator::{CoreMetrics, MetricsAggregator};
pub use data::{HardwareInfo, MetricsSnapshot};
pub use sampler::{PerformanceSampler, RawSample};
pub use traits::{CounterSource, HardwareProbe};
