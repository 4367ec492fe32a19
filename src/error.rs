//! Error taxonomy for the device session.
//!
//! Three distinct failure surfaces:
//!
//! * [`LinkError`] — the external BLE capability failed (scan, connect,
//!   discovery, subscription, read, write).
//! * [`MalformedPacket`] — a notification or read payload did not match the
//!   wire format. Never fatal to a live connection; the session downgrades
//!   it to a [`crate::types::DeviceEvent::DecodeError`] event.
//! * [`SessionError`] — the reason carried inside `ConnectFailed` and
//!   `CommandFailed` events.
//!
//! All types are `Clone + PartialEq` so they can travel inside events and
//! be asserted on directly in tests.

use thiserror::Error;
use uuid::Uuid;

/// A failure reported by the BLE link layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// No device matching the expected name/service was found in range.
    #[error("peer device not found")]
    PeerNotFound,
    /// The peer refused pairing or the platform denied Bluetooth access.
    #[error("pairing rejected")]
    PairingRejected,
    /// The link dropped, or an operation required a connection that no
    /// longer exists.
    #[error("link dropped")]
    LinkDropped,
    /// A link operation did not complete in time.
    #[error("link operation timed out")]
    Timeout,
    /// The connected device does not expose a required characteristic.
    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),
    /// Any other platform/link-layer failure, stringified.
    #[error("{0}")]
    Other(String),
}

/// A byte buffer that does not decode as the wire format says it should.
///
/// The message names the violated constraint (wrong length, non-unit
/// quaternion, non-boolean flag byte, stale config version).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed packet: {0}")]
pub struct MalformedPacket(pub &'static str);

/// Why a `connect()` attempt or a command was not carried out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The underlying link operation failed.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// A command was issued while the session was not in the Ready state,
    /// or `connect()` was issued while a link already existed.
    #[error("session is not ready")]
    NotReady,
    /// An in-flight operation was cancelled by a disconnect.
    #[error("aborted by disconnect")]
    Aborted,
}
