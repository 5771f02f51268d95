//! Ownership of the single open display handle.

use crate::device::backoff::RediscoveryBackoff;
use crate::device::frame::{CommandFrame, FRAME_LEN};
use crate::device::hid::{DefaultHidBackend, HidBackend, HidTransport};
use crate::error::{Result, SystemError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Report id prepended to every frame.
pub const REPORT_ID: u8 = 0;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Discovers the peripheral and writes frames to it.
///
/// At most one handle is open at a time. The manager never rediscovers on its
/// own inside [`send`](Self::send); the scheduler drives
/// [`maybe_rediscover`](Self::maybe_rediscover) once per tick.
pub struct DeviceManager {
    backend: Box<dyn HidBackend>,
    vendor_id: u16,
    product_id: u16,
    handle: Option<Box<dyn HidTransport>>,
    consecutive_failures: u32,
    drop_after_failures: u32,
    backoff: RediscoveryBackoff,
}

impl DeviceManager {
    pub fn new(
        backend: Box<dyn HidBackend>,
        vendor_id: u16,
        product_id: u16,
        drop_after_failures: u32,
    ) -> Self {
        Self {
            backend,
            vendor_id,
            product_id,
            handle: None,
            consecutive_failures: 0,
            drop_after_failures: drop_after_failures.max(1),
            backoff: RediscoveryBackoff::new(BACKOFF_INITIAL, BACKOFF_MAX),
        }
    }

    /// Manager over the compiled-in HID backend.
    pub fn with_default_backend(
        vendor_id: u16,
        product_id: u16,
        drop_after_failures: u32,
    ) -> Result<Self> {
        let backend = DefaultHidBackend::new()?;
        Ok(Self::new(
            Box::new(backend),
            vendor_id,
            product_id,
            drop_after_failures,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Open the first matching device. A no-op when already connected.
    pub fn discover(&mut self) -> Result<()> {
        self.discover_at(Instant::now())
    }

    fn discover_at(&mut self, now: Instant) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        match self.backend.open(self.vendor_id, self.product_id) {
            Ok(handle) => {
                info!("Display connected: {}", handle.describe());
                self.handle = Some(handle);
                self.consecutive_failures = 0;
                self.backoff.mark_success(now);
                Ok(())
            }
            Err(err) => {
                self.backoff.mark_failure(now);
                debug!("Display discovery failed: {}", err);
                Err(err)
            }
        }
    }

    /// Attempt discovery if disconnected and the backoff window has passed.
    ///
    /// Returns whether a handle is open afterwards.
    pub fn maybe_rediscover(&mut self, now: Instant) -> bool {
        if self.handle.is_none() && self.backoff.should_attempt(now) {
            let _ = self.discover_at(now);
        }
        self.is_connected()
    }

    /// Write `frame` as output report 0.
    pub fn send(&mut self, frame: &CommandFrame) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(SystemError::DeviceNotFound {
                vendor_id: self.vendor_id,
                product_id: self.product_id,
            });
        };

        let mut report = [0u8; FRAME_LEN + 1];
        report[0] = REPORT_ID;
        report[1..].copy_from_slice(frame.as_bytes());

        let result = match handle.write_report(&report) {
            Ok(0) => Err(SystemError::device_write("device accepted 0 bytes")),
            Ok(_) => Ok(()),
            Err(err) => Err(SystemError::device_write(err.to_string())),
        };

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.drop_after_failures {
                    warn!(
                        "Display write failed {} times in a row, releasing handle: {}",
                        self.consecutive_failures, err
                    );
                    self.release();
                }
                Err(err)
            }
        }
    }

    /// Release the open handle, if any.
    pub fn disconnect(&mut self) {
        if self.handle.is_some() {
            info!("Display disconnected");
            self.release();
        }
    }

    fn release(&mut self) {
        self.handle = None;
        self.consecutive_failures = 0;
        self.backoff.mark_failure(Instant::now());
    }
}
