//! Traits at the hardware seams of the metrics pipeline.

use crate::error::Result;
use crate::metrics::sampler::RawSample;
use async_trait::async_trait;

/// A facility that produces instantaneous hardware counter readings.
///
/// Implementations only read; the differential math lives in
/// [`PerformanceSampler`](crate::metrics::sampler::PerformanceSampler).
pub trait CounterSource: Send {
    /// Acquire the facility. Failure disables CPU metrics for the process.
    fn start(&mut self) -> Result<()>;

    /// Take one reading.
    fn read_sample(&mut self) -> Result<RawSample>;
}

/// GPU identity returned by a system profile query.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuIdentity {
    pub model: String,
    /// VRAM in GB, when the profile reports it
    pub vram_gb: Option<f64>,
}

/// Expensive, best-effort hardware queries.
///
/// Each call may take hundreds of milliseconds (external process
/// invocation), so callers run them off the main tick.
#[async_trait]
pub trait HardwareProbe: Send + Sync {
    /// Resolve GPU model and VRAM.
    async fn gpu_identity(&self) -> Result<GpuIdentity>;

    /// Resolve the memory module frequency in MHz.
    async fn memory_frequency(&self) -> Result<f64>;

    /// Sample the current GPU utilization percentage.
    async fn gpu_usage(&self) -> Result<f64>;
}
