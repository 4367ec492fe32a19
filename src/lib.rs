//! # sugarboat-rs
//!
//! Async Rust companion library for the **sugarboat** BLE tilt hydrometer —
//! a floating tilt/temperature/humidity sensor that infers fermentation
//! progress (Brix / specific gravity) from its floating angle.
//!
//! The crate owns the *device session*: the BLE connection lifecycle, the
//! binary wire protocol, and a typed event stream. It renders nothing and
//! stores nothing — a UI or logger subscribes to the events and does what
//! it likes with them.
//!
//! ## Quick start
//!
//! ```no_run
//! use sugarboat_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let link = BleLink::new(BleLinkConfig::default());
//!     let (session, mut events) = DeviceSession::spawn(link);
//!     session.connect().await;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             DeviceEvent::SensorData(s) => println!("{:.1} °Bx @ {:.1}°", s.brix, s.angle_deg),
//!             DeviceEvent::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`session`] | The [`session::DeviceSession`] actor: lifecycle, commands, events |
//! | [`link`] | The abstract BLE capability the session drives |
//! | [`ble`] | btleplug-backed [`ble::BleLink`] for real hardware |
//! | [`sim`] | In-memory [`sim::SimLink`] for tests and demos |
//! | [`types`] | Data records and the [`types::DeviceEvent`] stream |
//! | [`protocol`] | GATT UUIDs, opcodes, and command encoders |
//! | [`parse`] | Pure byte-to-record decoders |
//! | [`mux`] | Characteristic → decoder routing table |
//! | [`error`] | `LinkError` / `MalformedPacket` / `SessionError` taxonomy |

pub mod ble;
pub mod error;
pub mod link;
pub mod mux;
pub mod parse;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod types;

/// Convenience re-exports covering the whole caller-facing surface:
/// construct a link, spawn a session, consume events, send commands.
pub mod prelude {
    pub use crate::ble::{BleLink, BleLinkConfig};
    pub use crate::error::{LinkError, MalformedPacket, SessionError};
    pub use crate::link::{DeviceLink, Notification};
    pub use crate::session::DeviceSession;
    pub use crate::sim::{SimController, SimLink};
    pub use crate::types::{
        Channel, Coeffs, Command, CommandKind, Config, DeviceEvent, EulerAngles, Orientation,
        Quaternion, SensorData, SessionState,
    };
}
