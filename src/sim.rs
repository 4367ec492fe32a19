//! In-memory [`DeviceLink`] implementation.
//!
//! [`SimLink`] stands in for a real hydrometer: it honours the same trait
//! contract as [`crate::ble::BleLink`] and emulates just enough firmware
//! (a config register whose version bumps on calibration writes) to
//! exercise every session scenario without hardware. The paired
//! [`SimController`] is the "device side": it injects notifications, drops
//! the link, scripts failures, and exposes what the session wrote.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::LinkError;
use crate::link::{DeviceLink, Notification};
use crate::protocol::{
    COMMAND_CHARACTERISTIC, CONFIG_CHARACTERISTIC, CONFIG_LEN, NOTIFY_CHARACTERISTICS,
    OP_CALIBRATE_IMU, OP_SET_COEFFS, OP_SET_REALTIME_RUN, ORIENTATION_CHARACTERISTIC,
    ORIENTATION_LEN, SENSOR_DATA_CHARACTERISTIC, SENSOR_DATA_LEN,
};
use crate::types::{Coeffs, Config, Orientation, SensorData};

// ── Wire-format builders ──────────────────────────────────────────────────────
//
// The encode direction of the telemetry characteristics only exists on the
// device; these builders let tests and demos produce real payloads.

/// Encode an orientation payload exactly as the firmware does.
pub fn orientation_bytes(o: &Orientation) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ORIENTATION_LEN);
    for v in [
        o.quaternion.x,
        o.quaternion.y,
        o.quaternion.z,
        o.quaternion.w,
        o.euler.psi,
        o.euler.theta,
        o.euler.phi,
    ] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Encode a sensor-data payload exactly as the firmware does.
pub fn sensor_data_bytes(s: &SensorData) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SENSOR_DATA_LEN);
    for v in [
        s.angle_deg,
        s.brix,
        s.sg,
        s.temp_celsius,
        s.rel_humidity,
        s.batt_voltage,
    ] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Encode a config payload exactly as the firmware does.
pub fn config_bytes(c: &Config) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(CONFIG_LEN);
    bytes.extend_from_slice(&c.version.to_le_bytes());
    bytes.push(c.has_imu_offsets as u8);
    bytes.push(c.has_coeffs as u8);
    for v in [c.coeffs.a2, c.coeffs.a1, c.coeffs.a0] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

// ── Simulated device state ────────────────────────────────────────────────────

struct SimState {
    device_name: String,
    connected: bool,
    characteristics: Vec<Uuid>,
    subscriptions: Vec<Uuid>,
    writes: Vec<(Uuid, Vec<u8>)>,
    config: Config,
    realtime_run: bool,
    connect_delay: Duration,
    write_delay: Duration,
    fail_connect: Option<LinkError>,
    fail_discover: Option<LinkError>,
    fail_subscribe: Option<LinkError>,
    fail_write: Option<LinkError>,
    fail_read: Option<LinkError>,
}

impl SimState {
    fn new() -> Self {
        let mut characteristics = NOTIFY_CHARACTERISTICS.to_vec();
        characteristics.push(COMMAND_CHARACTERISTIC);
        Self {
            device_name: "sugarboat-0001".into(),
            connected: false,
            characteristics,
            subscriptions: Vec::new(),
            writes: Vec::new(),
            config: Config {
                version: 1,
                has_imu_offsets: false,
                has_coeffs: false,
                coeffs: Coeffs {
                    a2: 0.0,
                    a1: 0.0,
                    a0: 0.0,
                },
            },
            realtime_run: false,
            connect_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
            fail_connect: None,
            fail_discover: None,
            fail_subscribe: None,
            fail_write: None,
            fail_read: None,
        }
    }

    /// Apply a command frame the way the firmware would.
    fn apply_command(&mut self, payload: &[u8]) {
        match payload.first() {
            Some(&OP_CALIBRATE_IMU) => {
                self.config.has_imu_offsets = true;
                self.config.version += 1;
            }
            Some(&OP_SET_COEFFS) if payload.len() == 13 => {
                let f = |off: usize| {
                    f32::from_le_bytes([
                        payload[off],
                        payload[off + 1],
                        payload[off + 2],
                        payload[off + 3],
                    ])
                };
                self.config.coeffs = Coeffs {
                    a2: f(1),
                    a1: f(5),
                    a0: f(9),
                };
                self.config.has_coeffs = true;
                self.config.version += 1;
            }
            Some(&OP_SET_REALTIME_RUN) if payload.len() == 2 => {
                self.realtime_run = payload[1] != 0;
            }
            _ => {}
        }
    }
}

/// The link half handed to a [`crate::session::DeviceSession`].
pub struct SimLink {
    state: Arc<Mutex<SimState>>,
    notif_rx: Option<mpsc::UnboundedReceiver<Notification>>,
}

/// The device half kept by the test or demo driving the simulation.
pub struct SimController {
    state: Arc<Mutex<SimState>>,
    notif_tx: Option<mpsc::UnboundedSender<Notification>>,
}

impl SimLink {
    pub fn new() -> (SimLink, SimController) {
        let state = Arc::new(Mutex::new(SimState::new()));
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        (
            SimLink {
                state: Arc::clone(&state),
                notif_rx: Some(notif_rx),
            },
            SimController {
                state,
                notif_tx: Some(notif_tx),
            },
        )
    }
}

impl SimController {
    /// Push a raw notification, preserving injection order.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        if let Some(tx) = &self.notif_tx {
            let _ = tx.send(Notification {
                characteristic,
                value,
            });
        }
    }

    pub fn notify_orientation(&self, orientation: &Orientation) {
        self.notify(ORIENTATION_CHARACTERISTIC, orientation_bytes(orientation));
    }

    pub fn notify_sensor_data(&self, sensor_data: &SensorData) {
        self.notify(SENSOR_DATA_CHARACTERISTIC, sensor_data_bytes(sensor_data));
    }

    /// Push the device's current config as an unsolicited notification.
    pub fn notify_config(&self) {
        let bytes = config_bytes(&self.state.lock().unwrap().config);
        self.notify(CONFIG_CHARACTERISTIC, bytes);
    }

    /// Simulate a peer-initiated disconnect by closing the notification
    /// stream, the same signal a real link delivers.
    pub fn drop_link(&mut self) {
        self.notif_tx = None;
    }

    /// Every write the session performed, in order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Characteristics the session has subscribed to, in order.
    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    /// The device's current config register.
    pub fn config(&self) -> Config {
        self.state.lock().unwrap().config
    }

    /// Overwrite the device's config register (e.g. to script a stale
    /// version push).
    pub fn set_config(&self, config: Config) {
        self.state.lock().unwrap().config = config;
    }

    /// Whether the device is currently in high-rate streaming mode.
    pub fn realtime_run(&self) -> bool {
        self.state.lock().unwrap().realtime_run
    }

    /// Replace the characteristic set reported by discovery.
    pub fn set_characteristics(&self, characteristics: Vec<Uuid>) {
        self.state.lock().unwrap().characteristics = characteristics;
    }

    /// Stall `connect()` for `delay`, leaving a window to race other calls
    /// against an in-flight connect.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().connect_delay = delay;
    }

    /// Stall every `write()` for `delay`, leaving a window to race other
    /// calls against an in-flight command.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = delay;
    }

    pub fn fail_next_connect(&self, err: LinkError) {
        self.state.lock().unwrap().fail_connect = Some(err);
    }

    pub fn fail_next_discover(&self, err: LinkError) {
        self.state.lock().unwrap().fail_discover = Some(err);
    }

    pub fn fail_next_subscribe(&self, err: LinkError) {
        self.state.lock().unwrap().fail_subscribe = Some(err);
    }

    pub fn fail_next_write(&self, err: LinkError) {
        self.state.lock().unwrap().fail_write = Some(err);
    }

    pub fn fail_next_read(&self, err: LinkError) {
        self.state.lock().unwrap().fail_read = Some(err);
    }
}

#[async_trait]
impl DeviceLink for SimLink {
    async fn connect(&mut self) -> Result<String, LinkError> {
        let delay = self.state.lock().unwrap().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_connect.take() {
            return Err(err);
        }
        state.connected = true;
        Ok(state.device_name.clone())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.subscriptions.clear();
        Ok(())
    }

    async fn discover_characteristics(&mut self) -> Result<Vec<Uuid>, LinkError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_discover.take() {
            return Err(err);
        }
        if !state.connected {
            return Err(LinkError::LinkDropped);
        }
        Ok(state.characteristics.clone())
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_subscribe.take() {
            return Err(err);
        }
        if !state.connected {
            return Err(LinkError::LinkDropped);
        }
        state.subscriptions.push(characteristic);
        Ok(())
    }

    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), LinkError> {
        let delay = self.state.lock().unwrap().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_write.take() {
            return Err(err);
        }
        if !state.connected {
            return Err(LinkError::LinkDropped);
        }
        state.writes.push((characteristic, payload.to_vec()));
        if characteristic == COMMAND_CHARACTERISTIC {
            state.apply_command(payload);
        }
        Ok(())
    }

    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_read.take() {
            return Err(err);
        }
        if !state.connected {
            return Err(LinkError::LinkDropped);
        }
        if characteristic == CONFIG_CHARACTERISTIC {
            Ok(config_bytes(&state.config))
        } else {
            Err(LinkError::CharacteristicNotFound(characteristic))
        }
    }

    async fn notifications(&mut self) -> Result<BoxStream<'static, Notification>, LinkError> {
        let rx = self
            .notif_rx
            .take()
            .ok_or_else(|| LinkError::Other("notification stream already taken".into()))?;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        })))
    }
}
