//! Error handling for the cooler HUD pipeline.

/// A specialized `Result` type for cooler HUD operations.
pub type Result<T> = std::result::Result<T, SystemError>;

/// The main error type for the sampling, encoding and delivery pipeline.
///
/// None of these are fatal to the process. The scheduler logs and absorbs
/// every pipeline failure; only configuration and lifecycle misuse reach
/// library callers.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System information parsing failed
    #[error("Failed to parse system information: {0}")]
    ParseError(String),

    /// The performance counter facility could not start or a counter is missing
    #[error("Performance sampler unavailable: {0}")]
    SamplerUnavailable(String),

    /// A differential metric was requested before two samples were taken
    #[error("Insufficient samples: {available} of 2 retained")]
    InsufficientSamples { available: usize },

    /// An external hardware query failed or timed out
    #[error("External query '{query}' failed: {reason}")]
    ExternalQuery { query: String, reason: String },

    /// No HID device matched the configured identifiers
    #[error("Device {vendor_id:04x}:{product_id:04x} not found")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    /// Writing an output report to the open device failed
    #[error("Device write failed: {0}")]
    DeviceWrite(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scheduler lifecycle misuse
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl SystemError {
    /// Create a new parse error
    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a new sampler-unavailable error
    pub fn sampler_unavailable(msg: impl Into<String>) -> Self {
        Self::SamplerUnavailable(msg.into())
    }

    /// Create a new external query error
    pub fn external_query(query: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExternalQuery {
            query: query.into(),
            reason: reason.into(),
        }
    }

    /// Create a new device write error
    pub fn device_write(msg: impl Into<String>) -> Self {
        Self::DeviceWrite(msg.into())
    }

    /// Create a new configuration error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new scheduler error
    pub fn scheduler_error(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }

    /// Whether this failure only concerns the physical display link.
    pub fn is_device_error(&self) -> bool {
        matches!(self, Self::DeviceNotFound { .. } | Self::DeviceWrite(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_not_found_formats_ids_as_hex() {
        let err = SystemError::DeviceNotFound {
            vendor_id: 0x3633,
            product_id: 0x0012,
        };
        assert_eq!(err.to_string(), "Device 3633:0012 not found");
        assert!(err.is_device_error());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SystemError = io.into();
        assert!(matches!(err, SystemError::Io(_)));
        assert!(!err.is_device_error());
    }
}
