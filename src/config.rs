//! Monitor configuration.

use crate::error::{Result, SystemError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sampling and delivery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Tick interval of the main pipeline in milliseconds
    pub interval_ms: u64,
    /// Mount point whose filesystem usage is reported
    pub mount_point: PathBuf,
    /// USB vendor id of the display peripheral
    pub vendor_id: u16,
    /// USB product id of the display peripheral
    pub product_id: u16,
    /// Seconds between GPU/RAM identity queries (0 = startup only)
    pub profile_interval_secs: u64,
    /// Seconds between GPU usage samples (0 = disabled)
    pub gpu_usage_interval_secs: u64,
    /// Upper bound for a single external query in milliseconds
    pub query_timeout_ms: u64,
    /// Consecutive write failures before the device handle is dropped
    pub rediscover_after_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: crate::DEFAULT_INTERVAL_MS,
            mount_point: PathBuf::from("/"),
            vendor_id: crate::DEFAULT_VENDOR_ID,
            product_id: crate::DEFAULT_PRODUCT_ID,
            profile_interval_secs: 300,
            gpu_usage_interval_secs: 5,
            query_timeout_ms: 10_000,
            rediscover_after_failures: 3,
        }
    }
}

impl MonitorConfig {
    /// Create a configuration targeting a specific peripheral.
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Default::default()
        }
    }

    /// Set the tick interval in milliseconds.
    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Set the mount point used for disk usage.
    pub fn with_mount_point(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.mount_point = mount_point.into();
        self
    }

    /// Set the identity query cadence.
    pub fn with_profile_interval_secs(mut self, secs: u64) -> Self {
        self.profile_interval_secs = secs;
        self
    }

    /// Set the GPU usage cadence.
    pub fn with_gpu_usage_interval_secs(mut self, secs: u64) -> Self {
        self.gpu_usage_interval_secs = secs;
        self
    }

    /// Set the external query timeout.
    pub fn with_query_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.query_timeout_ms = timeout_ms;
        self
    }

    /// Set the write failure threshold for dropping a stale handle.
    pub fn with_rediscover_after_failures(mut self, failures: u32) -> Self {
        self.rediscover_after_failures = failures;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// `None` when identity queries only run once at startup.
    pub fn profile_interval(&self) -> Option<Duration> {
        (self.profile_interval_secs > 0).then(|| Duration::from_secs(self.profile_interval_secs))
    }

    /// `None` when GPU usage sampling is disabled.
    pub fn gpu_usage_interval(&self) -> Option<Duration> {
        (self.gpu_usage_interval_secs > 0)
            .then(|| Duration::from_secs(self.gpu_usage_interval_secs))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(SystemError::config_error("tick interval must be non-zero"));
        }
        if self.query_timeout_ms == 0 {
            return Err(SystemError::config_error("query timeout must be non-zero"));
        }
        if self.rediscover_after_failures == 0 {
            return Err(SystemError::config_error(
                "rediscovery threshold must be at least one failure",
            ));
        }
        Ok(())
    }
}
