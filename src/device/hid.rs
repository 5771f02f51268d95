//! HID transport for the display peripheral.
//!
//! The real backend uses `hidapi` and is feature-gated so the crate builds on
//! hosts without libudev/IOKit headers. Without the `hid` feature every
//! discovery reports the device as absent and the rest of the pipeline keeps
//! running.

use crate::error::Result;

/// An open handle to one HID device.
pub trait HidTransport: Send {
    /// Write an output report. `report` starts with the report id byte.
    /// Returns the number of bytes accepted.
    fn write_report(&mut self, report: &[u8]) -> Result<usize>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Enumerates and opens HID devices.
pub trait HidBackend: Send {
    /// Open the first device matching `vendor_id`/`product_id`.
    fn open(&mut self, vendor_id: u16, product_id: u16) -> Result<Box<dyn HidTransport>>;
}

#[cfg(feature = "hid")]
mod hidapi_backend {
    use super::*;
    use crate::error::SystemError;
    use hidapi::{HidApi, HidDevice};
    use tracing::debug;

    /// Backend over the system HID stack.
    pub struct HidApiBackend {
        api: Option<HidApi>,
    }

    impl HidApiBackend {
        pub fn new() -> Result<Self> {
            Ok(Self { api: None })
        }

        fn api(&mut self) -> Result<&mut HidApi> {
            if self.api.is_none() {
                let api = HidApi::new().map_err(|e| {
                    SystemError::device_write(format!("Failed to initialize HID API: {}", e))
                })?;
                self.api = Some(api);
            } else if let Some(api) = self.api.as_mut() {
                api.refresh_devices().map_err(|e| {
                    SystemError::device_write(format!("Failed to enumerate HID devices: {}", e))
                })?;
            }
            self.api
                .as_mut()
                .ok_or_else(|| SystemError::device_write("HID API unavailable"))
        }
    }

    impl HidBackend for HidApiBackend {
        fn open(&mut self, vendor_id: u16, product_id: u16) -> Result<Box<dyn HidTransport>> {
            let not_found = SystemError::DeviceNotFound {
                vendor_id,
                product_id,
            };
            let api = match self.api() {
                Ok(api) => api,
                Err(err) => {
                    debug!("HID enumeration failed: {}", err);
                    return Err(not_found);
                }
            };

            let info = api
                .device_list()
                .find(|info| info.vendor_id() == vendor_id && info.product_id() == product_id)
                .ok_or(not_found)?;
            let description = format!(
                "{} {} ({:04x}:{:04x})",
                info.manufacturer_string().unwrap_or("unknown"),
                info.product_string().unwrap_or("device"),
                vendor_id,
                product_id
            );

            let device = info
                .open_device(api)
                .map_err(|e| SystemError::device_write(format!("Failed to open {}: {}", description, e)))?;

            Ok(Box::new(HidApiTransport {
                device,
                description,
            }))
        }
    }

    struct HidApiTransport {
        device: HidDevice,
        description: String,
    }

    impl HidTransport for HidApiTransport {
        fn write_report(&mut self, report: &[u8]) -> Result<usize> {
            self.device
                .write(report)
                .map_err(|e| SystemError::device_write(e.to_string()))
        }

        fn describe(&self) -> String {
            self.description.clone()
        }
    }
}

#[cfg(not(feature = "hid"))]
mod unsupported {
    use super::*;
    use crate::error::SystemError;

    /// Backend for builds without HID support; the device is never found.
    pub struct UnsupportedHidBackend;

    impl UnsupportedHidBackend {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }
    }

    impl HidBackend for UnsupportedHidBackend {
        fn open(&mut self, vendor_id: u16, product_id: u16) -> Result<Box<dyn HidTransport>> {
            Err(SystemError::DeviceNotFound {
                vendor_id,
                product_id,
            })
        }
    }
}

// Re-export the appropriate HID backend
#[cfg(feature = "hid")]
pub use hidapi_backend::HidApiBackend as DefaultHidBackend;

#[cfg(not(feature = "hid"))]
pub use unsupported::UnsupportedHidBackend as DefaultHidBackend;
