//! Binary decoders for hydrometer notification payloads.
//!
//! All functions here are pure — no I/O, no link handle, nothing but byte
//! slices in and typed records out. This is what keeps the wire format
//! testable without a device or a BLE stack, and keeps numeric-layout bugs
//! confined to one reviewable surface.
//!
//! | Function | Characteristic | Layout |
//! |---|---|---|
//! | [`decode_orientation`] | orientation | 7 × f32 LE (quat x,y,z,w + Euler psi,theta,phi) |
//! | [`decode_sensor_data`] | sensor-data | 6 × f32 LE |
//! | [`decode_config`] | config | u32 LE + 2 flag bytes + 3 × f32 LE |
//!
//! Decoders fail with [`MalformedPacket`] on any structural violation:
//! wrong length, a quaternion that is not approximately unit, or a flag
//! byte outside {0, 1}. A corrupted packet is reported, never coerced.

use crate::error::MalformedPacket;
use crate::protocol::{CONFIG_LEN, ORIENTATION_LEN, SENSOR_DATA_LEN};
use crate::types::{Coeffs, Config, EulerAngles, Orientation, Quaternion, SensorData};

/// Accepted band for the decoded quaternion norm. Anything outside is a
/// corrupted notification, not a usable orientation.
const QUAT_NORM_MIN: f32 = 0.98;
const QUAT_NORM_MAX: f32 = 1.02;

/// Read a little-endian `f32` at byte `offset`. Callers check length first.
fn read_f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Decode an orientation notification.
///
/// Rejects payloads of the wrong length, and payloads whose embedded
/// quaternion norm falls outside [0.98, 1.02] — a caller-visible signal of
/// a corrupted packet rather than a silent pass-through of nonsense
/// orientation.
pub fn decode_orientation(data: &[u8]) -> Result<Orientation, MalformedPacket> {
    if data.len() != ORIENTATION_LEN {
        return Err(MalformedPacket("orientation payload has wrong length"));
    }
    let quaternion = Quaternion {
        x: read_f32_le(data, 0),
        y: read_f32_le(data, 4),
        z: read_f32_le(data, 8),
        w: read_f32_le(data, 12),
    };
    let norm = quaternion.norm();
    if !(QUAT_NORM_MIN..=QUAT_NORM_MAX).contains(&norm) {
        return Err(MalformedPacket("quaternion is not unit norm"));
    }
    Ok(Orientation {
        quaternion,
        euler: EulerAngles {
            psi: read_f32_le(data, 16),
            theta: read_f32_le(data, 20),
            phi: read_f32_le(data, 24),
        },
    })
}

/// Decode an aggregate sensor-data notification.
///
/// Field order on the wire: angle, brix, sg, tempCelsius, relHumidity,
/// battVoltage. No clamping — out-of-physical-range values pass through
/// for the consumer to flag.
pub fn decode_sensor_data(data: &[u8]) -> Result<SensorData, MalformedPacket> {
    if data.len() != SENSOR_DATA_LEN {
        return Err(MalformedPacket("sensor-data payload has wrong length"));
    }
    Ok(SensorData {
        angle_deg: read_f32_le(data, 0),
        brix: read_f32_le(data, 4),
        sg: read_f32_le(data, 8),
        temp_celsius: read_f32_le(data, 12),
        rel_humidity: read_f32_le(data, 16),
        batt_voltage: read_f32_le(data, 20),
    })
}

/// Decode a config payload (notification or characteristic read).
///
/// Flag bytes other than 0 or 1 are malformed, not coerced to `true`.
pub fn decode_config(data: &[u8]) -> Result<Config, MalformedPacket> {
    if data.len() != CONFIG_LEN {
        return Err(MalformedPacket("config payload has wrong length"));
    }
    let flag = |byte: u8| match byte {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(MalformedPacket("config flag byte is not 0 or 1")),
    };
    Ok(Config {
        version: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        has_imu_offsets: flag(data[4])?,
        has_coeffs: flag(data[5])?,
        coeffs: Coeffs {
            a2: read_f32_le(data, 6),
            a1: read_f32_le(data, 10),
            a0: read_f32_le(data, 14),
        },
    })
}
