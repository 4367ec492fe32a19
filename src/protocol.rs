//! GATT UUIDs, payload layouts, and command encoders for the sugarboat
//! hydrometer.
//!
//! All UUIDs live in the sugarboat vendor namespace
//! `5342XXXX-b0a7-46c6-9d1e-4a2b8c5df30e`.
//!
//! All multi-byte fields are little-endian. The three notification
//! characteristics carry fixed-length payloads; command writes are a 1-byte
//! opcode followed by an opcode-specific payload.

use uuid::Uuid;

use crate::types::Coeffs;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service advertised by the hydrometer. Used as a scan filter.
pub const HYDROMETER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x53420000_b0a7_46c6_9d1e_4a2b8c5df30e);

/// Advertised device name prefix, used when no service filter is available.
pub const DEVICE_NAME_PREFIX: &str = "sugarboat";

// ── Characteristics ───────────────────────────────────────────────────────────

/// Orientation characteristic (notify) — one [`ORIENTATION_LEN`]-byte packet
/// per sample: quaternion x, y, z, w followed by Euler psi, theta, phi, all
/// `f32`. Notified at the IMU filter rate (~10 Hz).
pub const ORIENTATION_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x53420001_b0a7_46c6_9d1e_4a2b8c5df30e);

/// Aggregate sensor-data characteristic (notify) — one
/// [`SENSOR_DATA_LEN`]-byte packet in the fixed order
/// {angle, brix, sg, tempCelsius, relHumidity, battVoltage}, all `f32`.
/// Cadence is low by default; the set-realtime-run command raises it.
pub const SENSOR_DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x53420002_b0a7_46c6_9d1e_4a2b8c5df30e);

/// Configuration characteristic (read + notify) — [`CONFIG_LEN`] bytes:
/// `u32` version, 1 flag byte hasIMUOffsets, 1 flag byte hasCoeffs, then
/// coefficients a2, a1, a0 as `f32`. Flag bytes are strictly 0 or 1.
pub const CONFIG_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x53420003_b0a7_46c6_9d1e_4a2b8c5df30e);

/// Command characteristic (write) — accepts the frames produced by
/// [`encode_calibrate_imu`], [`encode_set_coeffs`] and
/// [`encode_set_realtime_run`].
pub const COMMAND_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x53420004_b0a7_46c6_9d1e_4a2b8c5df30e);

/// The notification characteristics a session subscribes to, in
/// subscription order.
pub const NOTIFY_CHARACTERISTICS: [Uuid; 3] = [
    ORIENTATION_CHARACTERISTIC,
    SENSOR_DATA_CHARACTERISTIC,
    CONFIG_CHARACTERISTIC,
];

// ── Payload sizes ─────────────────────────────────────────────────────────────

/// 7 × f32: quaternion x, y, z, w + Euler psi, theta, phi.
pub const ORIENTATION_LEN: usize = 28;

/// 6 × f32: angle, brix, sg, tempCelsius, relHumidity, battVoltage.
pub const SENSOR_DATA_LEN: usize = 24;

/// u32 version + 2 flag bytes + 3 × f32 coefficients.
pub const CONFIG_LEN: usize = 18;

// ── Command opcodes ───────────────────────────────────────────────────────────

/// Capture IMU accel/gyro offsets. No payload.
pub const OP_CALIBRATE_IMU: u8 = 0x01;

/// Replace the Brix coefficients. Payload: a2, a1, a0 as `f32`.
pub const OP_SET_COEFFS: u8 = 0x02;

/// Toggle the high-rate sensor-data cadence. Payload: one flag byte.
pub const OP_SET_REALTIME_RUN: u8 = 0x03;

// ── Encoders ──────────────────────────────────────────────────────────────────
//
// Encoders never fail: every well-formed input has exactly one wire form.
// Range-validating coefficients is the caller's business.

/// Encode the zero-argument calibrate-IMU command.
///
/// ```
/// # use sugarboat_rs::protocol::{encode_calibrate_imu, OP_CALIBRATE_IMU};
/// assert_eq!(encode_calibrate_imu(), &[OP_CALIBRATE_IMU]);
/// ```
pub fn encode_calibrate_imu() -> Vec<u8> {
    vec![OP_CALIBRATE_IMU]
}

/// Encode a coefficient upload: opcode + a2, a1, a0 as little-endian `f32`.
pub fn encode_set_coeffs(coeffs: &Coeffs) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(13);
    bytes.push(OP_SET_COEFFS);
    bytes.extend_from_slice(&coeffs.a2.to_le_bytes());
    bytes.extend_from_slice(&coeffs.a1.to_le_bytes());
    bytes.extend_from_slice(&coeffs.a0.to_le_bytes());
    bytes
}

/// Encode the streaming-rate toggle: opcode + one flag byte.
pub fn encode_set_realtime_run(run: bool) -> Vec<u8> {
    vec![OP_SET_REALTIME_RUN, run as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibrate_imu_is_a_bare_opcode() {
        assert_eq!(encode_calibrate_imu(), vec![OP_CALIBRATE_IMU]);
    }

    #[test]
    fn set_coeffs_layout() {
        let coeffs = Coeffs {
            a2: 0.001,
            a1: 0.2,
            a0: 5.0,
        };
        let bytes = encode_set_coeffs(&coeffs);
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[0], OP_SET_COEFFS);
        assert_eq!(&bytes[1..5], &0.001f32.to_le_bytes());
        assert_eq!(&bytes[5..9], &0.2f32.to_le_bytes());
        assert_eq!(&bytes[9..13], &5.0f32.to_le_bytes());
    }

    #[test]
    fn set_realtime_run_flag_byte() {
        assert_eq!(encode_set_realtime_run(true), vec![OP_SET_REALTIME_RUN, 1]);
        assert_eq!(encode_set_realtime_run(false), vec![OP_SET_REALTIME_RUN, 0]);
    }
}
