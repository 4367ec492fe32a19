use crate::error::{LinkError, MalformedPacket, SessionError};

/// A unit quaternion as reported by the device's sensor-fusion filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quaternion {
    /// Euclidean norm. The device always sends unit quaternions; the decoder
    /// rejects anything whose norm falls outside [0.98, 1.02].
    pub fn norm(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }
}

/// Euler angles in radians, aerospace order (psi = yaw, theta = pitch,
/// phi = roll). Computed on the device from the same filter state as the
/// quaternion, so the two fields of [`Orientation`] are always consistent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerAngles {
    pub psi: f32,
    pub theta: f32,
    pub phi: f32,
}

/// One orientation notification, decoded.
///
/// Each decode yields a fresh immutable value that supersedes the previous
/// one; there is no identity to track across packets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub quaternion: Quaternion,
    pub euler: EulerAngles,
}

/// One aggregate sensor reading, decoded.
///
/// All fields are computed on the device and replaced atomically — a decode
/// yields a complete new value, never a partial update. Values are passed
/// through unclamped; flagging out-of-physical-range readings is left to
/// the consumer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorData {
    /// Tilt angle in degrees.
    pub angle_deg: f32,
    /// Estimated sugar content in °Bx.
    pub brix: f32,
    /// Estimated specific gravity (dimensionless).
    pub sg: f32,
    /// Board temperature in °C.
    pub temp_celsius: f32,
    /// Relative humidity as a fraction in 0–1.
    pub rel_humidity: f32,
    /// Battery voltage in volts.
    pub batt_voltage: f32,
}

/// Quadratic calibration coefficients converting tilt angle to Brix:
/// `brix = a2·angle² + a1·angle + a0`.
///
/// Owned by the device. The session holds a transient cached copy inside
/// the last [`Config`]; on receipt of a newer `Config` the copy is fully
/// replaced, never merged with local edits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coeffs {
    pub a2: f32,
    pub a1: f32,
    pub a0: f32,
}

impl Coeffs {
    /// Evaluate the Brix polynomial at `angle_deg`. Useful for previewing
    /// an edited calibration before uploading it.
    pub fn brix_at(&self, angle_deg: f32) -> f32 {
        (self.a2 * angle_deg + self.a1) * angle_deg + self.a0
    }
}

/// Device-side configuration state, read from the config characteristic.
///
/// `version` strictly increases within one connection (it only resets when
/// the device reboots); calibration and coefficient-upload commands bump
/// it, which is why the session re-reads the characteristic after those
/// commands are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub version: u32,
    /// The device holds valid IMU accel/gyro offsets.
    pub has_imu_offsets: bool,
    /// The device holds valid Brix coefficients.
    pub has_coeffs: bool,
    pub coeffs: Coeffs,
}

/// Connection lifecycle states of a [`crate::session::DeviceSession`].
///
/// Owned exclusively by the session; observable through
/// [`crate::session::DeviceSession::state`] but never externally mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    DiscoveringServices,
    Subscribing,
    Ready,
    Disconnecting,
}

/// The three notification characteristics, as a typed identity for
/// decode-error reporting and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Orientation,
    SensorData,
    Config,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Orientation => write!(f, "orientation"),
            Channel::SensorData => write!(f, "sensor-data"),
            Channel::Config => write!(f, "config"),
        }
    }
}

/// A command the session can write to the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Capture IMU offsets while the device sits level and still.
    CalibrateImu,
    /// Upload a new set of Brix coefficients.
    SetCoeffs(Coeffs),
    /// Toggle the high-rate sensor-data notification cadence.
    SetRealtimeRun(bool),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::CalibrateImu => CommandKind::CalibrateImu,
            Command::SetCoeffs(_) => CommandKind::SetCoeffs,
            Command::SetRealtimeRun(_) => CommandKind::SetRealtimeRun,
        }
    }
}

/// Which command an ack or failure refers to, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    CalibrateImu,
    SetCoeffs,
    SetRealtimeRun,
}

/// Everything a [`crate::session::DeviceSession`] reports to its caller.
///
/// Consumers receive these through the `mpsc::Receiver` returned by
/// [`crate::session::DeviceSession::spawn`]. Failures travel on the same
/// stream as data, so one subscriber sees the whole session.
///
/// Guarantees:
/// * at most one `Connected` per successful connect sequence;
/// * exactly one `Disconnected` per teardown, whether the peer or the
///   caller initiated it — a plain boolean "connected" flag folded over
///   this stream never double-counts;
/// * decoded telemetry is emitted in link arrival order (no ordering is
///   promised *across* characteristics, since the link makes none).
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The link is up, services discovered, all subscriptions confirmed.
    /// Carries the advertised device name.
    Connected(String),
    /// The link has been torn down. The session is back in
    /// [`SessionState::Disconnected`] and can be connected again.
    Disconnected,
    /// A connect attempt failed (or was aborted); no partial link state
    /// was retained.
    ConnectFailed(SessionError),
    /// A fresh orientation sample.
    Orientation(Orientation),
    /// A fresh aggregate sensor reading.
    SensorData(SensorData),
    /// Device configuration, either pushed by the device or re-read after
    /// an acknowledged calibration/coefficient command. Strictly newer
    /// (by `version`) than any previously emitted `Config`.
    Config(Config),
    /// The command write was accepted by the link layer.
    CommandAck(CommandKind),
    /// The command was rejected (`NotReady`), failed at the link layer, or
    /// was aborted by a disconnect.
    CommandFailed(CommandKind, SessionError),
    /// The config re-read promised after an acknowledged calibration or
    /// coefficient command failed at the link layer; no fresh `Config` is
    /// coming for that ack.
    ConfigRefreshFailed(LinkError),
    /// A notification on a known characteristic failed to decode. The
    /// session stays connected; persistent decode errors on one channel
    /// are worth surfacing to the user but are not a reason to disconnect.
    DecodeError {
        channel: Channel,
        reason: MalformedPacket,
    },
}
