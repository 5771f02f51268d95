//! Delivery of encoded frames to the cooler display over USB HID.

pub mod backoff;
pub mod frame;
pub mod hid;
pub mod manager;

// Re-export commonly used items
pub use frame::{CommandFrame, FrameEncoder};
pub use hid::{DefaultHidBackend, HidBackend, HidTransport};
pub use manager::DeviceManager;
