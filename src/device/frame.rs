//! Fixed 20-byte command frame understood by the cooler display.
//!
//! Layout (multi-byte fields big-endian):
//!
//! | Offset | Field                                   |
//! |--------|-----------------------------------------|
//! | 0      | marker `16`                             |
//! | 1..=7  | command prefix                          |
//! | 8..=9  | package power, whole watts (u16)        |
//! | 10     | reserved                                |
//! | 11..=14| package temperature, f32 bit pattern    |
//! | 15     | CPU utilization, 0..=100                |
//! | 16..=17| CPU frequency, whole MHz (u16)          |
//! | 18     | checksum of bytes 1..=17, mod 256       |
//! | 19     | terminator `22`                         |

use crate::metrics::data::MetricsSnapshot;

pub const FRAME_LEN: usize = 20;
pub const FRAME_MARKER: u8 = 16;
pub const FRAME_TERMINATOR: u8 = 22;
pub const COMMAND_PREFIX: [u8; 7] = [104, 1, 4, 13, 1, 2, 8];

const POWER: usize = 8;
const TEMPERATURE: usize = 11;
const UTILIZATION: usize = 15;
const FREQUENCY: usize = 16;
const CHECKSUM: usize = 18;

/// An encoded, immutable output report payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandFrame([u8; FRAME_LEN]);

impl CommandFrame {
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    /// Stored checksum byte.
    pub fn checksum(&self) -> u8 {
        self.0[CHECKSUM]
    }

    /// Marker, terminator and checksum all hold.
    pub fn is_valid(&self) -> bool {
        self.0[0] == FRAME_MARKER
            && self.0[FRAME_LEN - 1] == FRAME_TERMINATOR
            && self.0[CHECKSUM] == checksum(&self.0)
    }

    pub fn power_w(&self) -> u16 {
        u16::from_be_bytes([self.0[POWER], self.0[POWER + 1]])
    }

    pub fn temperature_c(&self) -> f32 {
        let mut bits = [0u8; 4];
        bits.copy_from_slice(&self.0[TEMPERATURE..TEMPERATURE + 4]);
        f32::from_be_bytes(bits)
    }

    pub fn utilization(&self) -> u8 {
        self.0[UTILIZATION]
    }

    pub fn frequency_mhz(&self) -> u16 {
        u16::from_be_bytes([self.0[FREQUENCY], self.0[FREQUENCY + 1]])
    }
}

impl AsRef<[u8]> for CommandFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Maps metrics onto the wire layout.
///
/// Encoding is total: out-of-range or non-finite inputs are clamped, since
/// the peripheral has no way to report a malformed frame.
pub struct FrameEncoder;

impl FrameEncoder {
    pub fn encode(snapshot: &MetricsSnapshot) -> CommandFrame {
        Self::encode_values(
            snapshot.cpu.package_power_w,
            snapshot.cpu.package_temp_c,
            snapshot.cpu.utilization_percent,
            snapshot.cpu.frequency_mhz,
        )
    }

    pub fn encode_values(
        power_w: f64,
        temperature_c: f64,
        utilization_percent: f64,
        frequency_mhz: f64,
    ) -> CommandFrame {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0] = FRAME_MARKER;
        bytes[1..8].copy_from_slice(&COMMAND_PREFIX);

        bytes[POWER..POWER + 2].copy_from_slice(&saturate_u16(power_w).to_be_bytes());

        let temperature = if temperature_c.is_finite() {
            temperature_c as f32
        } else {
            0.0
        };
        bytes[TEMPERATURE..TEMPERATURE + 4].copy_from_slice(&temperature.to_be_bytes());

        bytes[UTILIZATION] = if utilization_percent.is_nan() {
            0
        } else {
            utilization_percent.clamp(0.0, 100.0) as u8
        };

        bytes[FREQUENCY..FREQUENCY + 2].copy_from_slice(&saturate_u16(frequency_mhz).to_be_bytes());

        bytes[CHECKSUM] = checksum(&bytes);
        bytes[FRAME_LEN - 1] = FRAME_TERMINATOR;
        CommandFrame(bytes)
    }
}

fn checksum(bytes: &[u8; FRAME_LEN]) -> u8 {
    let sum: u32 = bytes[1..=17].iter().map(|&b| u32::from(b)).sum();
    (sum % 256) as u8
}

/// Truncate towards zero into `u16`, mapping NaN and negatives to 0.
fn saturate_u16(value: f64) -> u16 {
    if value.is_nan() {
        0
    } else {
        value.clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_frame() {
        let frame = FrameEncoder::encode_values(150.0, 72.5, 63.0, 4200.0);
        let bytes = frame.as_bytes();

        assert_eq!(bytes[0], 16);
        assert_eq!(&bytes[1..8], &[104, 1, 4, 13, 1, 2, 8]);
        assert_eq!(&bytes[8..10], &[0x00, 0x96]);
        assert_eq!(bytes[10], 0);
        assert_eq!(&bytes[11..15], &72.5f32.to_be_bytes());
        assert_eq!(bytes[15], 0x3F);
        assert_eq!(&bytes[16..18], &[0x10, 0x68]);
        let expected: u32 = bytes[1..=17].iter().map(|&b| b as u32).sum();
        assert_eq!(bytes[18], (expected % 256) as u8);
        assert_eq!(bytes[19], 22);
        assert!(frame.is_valid());
    }

    #[test]
    fn test_power_and_frequency_truncate() {
        let frame = FrameEncoder::encode_values(45.99, 0.0, 0.0, 3599.9);
        assert_eq!(frame.power_w(), 45);
        assert_eq!(frame.frequency_mhz(), 3599);
    }

    #[test]
    fn test_out_of_range_inputs_are_clamped() {
        let frame = FrameEncoder::encode_values(-12.0, f64::NAN, 150.0, 1.0e9);
        assert_eq!(frame.power_w(), 0);
        assert_eq!(frame.temperature_c(), 0.0);
        assert_eq!(frame.utilization(), 100);
        assert_eq!(frame.frequency_mhz(), u16::MAX);
        assert!(frame.is_valid());

        let frame = FrameEncoder::encode_values(f64::INFINITY, 40.0, -5.0, f64::NAN);
        assert_eq!(frame.power_w(), u16::MAX);
        assert_eq!(frame.utilization(), 0);
        assert_eq!(frame.frequency_mhz(), 0);
        assert!(frame.is_valid());
    }

    #[test]
    fn test_negative_temperature_round_trips() {
        let frame = FrameEncoder::encode_values(0.0, -10.25, 0.0, 0.0);
        assert_eq!(frame.temperature_c(), -10.25);
    }

    #[test]
    fn test_encode_reads_cpu_fields() {
        let mut snapshot = MetricsSnapshot::new();
        snapshot.cpu.package_power_w = 95.4;
        snapshot.cpu.package_temp_c = 61.0;
        snapshot.cpu.utilization_percent = 12.7;
        snapshot.cpu.frequency_mhz = 3800.0;

        let frame = FrameEncoder::encode(&snapshot);
        assert_eq!(frame.power_w(), 95);
        assert_eq!(frame.temperature_c(), 61.0);
        assert_eq!(frame.utilization(), 12);
        assert_eq!(frame.frequency_mhz(), 3800);
    }

    #[test]
    fn test_checksum_wraps() {
        let frame = FrameEncoder::encode_values(65535.0, 1.0e30, 100.0, 65535.0);
        let sum: u32 = frame.as_bytes()[1..=17].iter().map(|&b| b as u32).sum();
        assert!(sum > 255);
        assert_eq!(frame.checksum(), (sum % 256) as u8);
    }
}
