//! The injected BLE capability the session depends on.
//!
//! The session never talks to a BLE stack directly — it drives a
//! [`DeviceLink`], an abstract connect/discover/subscribe/write/read/notify
//! surface. [`crate::ble::BleLink`] implements it against btleplug;
//! [`crate::sim::SimLink`] implements it in memory so every session
//! scenario runs without hardware.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::LinkError;

/// One inbound notification: which characteristic fired and its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Asynchronous BLE link operations, each resolving with success or a
/// [`LinkError`].
///
/// Exactly one session owns a link at a time; only the session reads from
/// or writes to it. The codec and multiplexer see byte buffers only.
///
/// Device discovery and pairing live behind [`connect`](Self::connect):
/// an implementation scans for its device, establishes the link, and
/// returns the advertised device name.
#[async_trait]
pub trait DeviceLink: Send + 'static {
    /// Discover the peer, pair if needed, and establish the link.
    /// Returns the advertised device name.
    async fn connect(&mut self) -> Result<String, LinkError>;

    /// Tear the link down. Implementations tolerate being called when no
    /// link exists.
    async fn disconnect(&mut self) -> Result<(), LinkError>;

    /// Run GATT service discovery and return every characteristic the
    /// device exposes.
    async fn discover_characteristics(&mut self) -> Result<Vec<Uuid>, LinkError>;

    /// Enable notifications on one characteristic.
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError>;

    /// Write a payload to one characteristic.
    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), LinkError>;

    /// Read the current value of one characteristic.
    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, LinkError>;

    /// The inbound notification stream, in link arrival order. The stream
    /// ending signals a peer-initiated disconnect.
    async fn notifications(&mut self) -> Result<BoxStream<'static, Notification>, LinkError>;
}
