//! Characteristic multiplexer: one table from GATT characteristic to
//! decoder and event kind.
//!
//! Routing is a pure function so arrival order is trivially preserved and
//! the table is testable without a session. Decode failures on a known
//! characteristic become [`DeviceEvent::DecodeError`] values instead of
//! errors, so one bad packet never crosses the session boundary as a
//! failure, and routing of subsequent notifications is unaffected.

use uuid::Uuid;

use crate::parse::{decode_config, decode_orientation, decode_sensor_data};
use crate::protocol::{
    CONFIG_CHARACTERISTIC, ORIENTATION_CHARACTERISTIC, SENSOR_DATA_CHARACTERISTIC,
};
use crate::types::{Channel, DeviceEvent};

/// Identify the channel a characteristic belongs to, if any.
pub fn channel_of(characteristic: Uuid) -> Option<Channel> {
    match characteristic {
        ORIENTATION_CHARACTERISTIC => Some(Channel::Orientation),
        SENSOR_DATA_CHARACTERISTIC => Some(Channel::SensorData),
        CONFIG_CHARACTERISTIC => Some(Channel::Config),
        _ => None,
    }
}

/// Route one inbound notification to its decoder.
///
/// Returns `None` for an unknown characteristic — firmware that adds
/// characteristics must not break the session, so the caller logs and
/// drops those. A known characteristic always yields an event: the decoded
/// value, or a `DecodeError` carrying the reason.
pub fn route(characteristic: Uuid, payload: &[u8]) -> Option<DeviceEvent> {
    let channel = channel_of(characteristic)?;
    let decoded = match channel {
        Channel::Orientation => decode_orientation(payload).map(DeviceEvent::Orientation),
        Channel::SensorData => decode_sensor_data(payload).map(DeviceEvent::SensorData),
        Channel::Config => decode_config(payload).map(DeviceEvent::Config),
    };
    Some(decoded.unwrap_or_else(|reason| DeviceEvent::DecodeError { channel, reason }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SENSOR_DATA_LEN;

    fn sensor_bytes() -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SENSOR_DATA_LEN);
        for v in [20.0f32, 10.0, 1.04, 18.0, 0.5, 4.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn routes_sensor_data_to_its_decoder() {
        let event = route(SENSOR_DATA_CHARACTERISTIC, &sensor_bytes()).unwrap();
        match event {
            DeviceEvent::SensorData(s) => assert_eq!(s.angle_deg, 20.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_failure_becomes_an_event_not_an_error() {
        let event = route(SENSOR_DATA_CHARACTERISTIC, &[0u8; 20]).unwrap();
        match event {
            DeviceEvent::DecodeError { channel, .. } => {
                assert_eq!(channel, Channel::SensorData)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_characteristic_is_dropped() {
        let unknown = Uuid::from_u128(0xdead_beef);
        assert_eq!(route(unknown, &sensor_bytes()), None);
    }

    #[test]
    fn one_bad_packet_does_not_poison_routing() {
        assert!(matches!(
            route(SENSOR_DATA_CHARACTERISTIC, &[1, 2, 3]).unwrap(),
            DeviceEvent::DecodeError { .. }
        ));
        assert!(matches!(
            route(SENSOR_DATA_CHARACTERISTIC, &sensor_bytes()).unwrap(),
            DeviceEvent::SensorData(_)
        ));
    }
}
