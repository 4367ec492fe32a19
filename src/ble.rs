//! Real [`DeviceLink`] implementation on top of btleplug.
//!
//! Scanning, connecting, and GATT plumbing for an actual hydrometer. All
//! the platform quirks live here (CoreBluetooth power-up latency on macOS,
//! BlueZ GATT-cache lag on Linux) so the session and codec stay portable.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{info, warn};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::LinkError;
use crate::link::{DeviceLink, Notification};
use crate::protocol::{DEVICE_NAME_PREFIX, HYDROMETER_SERVICE_UUID};

/// A BLE connect typically completes in under 2 s; ten is generous and
/// bounds the cases where the platform stack blocks indefinitely.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct BleLinkConfig {
    /// Match devices whose advertised name starts with this string.
    pub name_prefix: String,
    /// How long to scan before giving up with `PeerNotFound`.
    pub scan_timeout_secs: u64,
}

impl Default for BleLinkConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEVICE_NAME_PREFIX.into(),
            scan_timeout_secs: 15,
        }
    }
}

/// btleplug-backed link to a hydrometer.
pub struct BleLink {
    config: BleLinkConfig,
    peripheral: Option<Peripheral>,
}

impl BleLink {
    pub fn new(config: BleLinkConfig) -> Self {
        Self {
            config,
            peripheral: None,
        }
    }

    fn peripheral(&self) -> Result<&Peripheral, LinkError> {
        self.peripheral.as_ref().ok_or(LinkError::LinkDropped)
    }

    fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic, LinkError> {
        self.peripheral()?
            .characteristics()
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or(LinkError::CharacteristicNotFound(uuid))
    }

    /// Poll the adapter's peripheral cache until a matching device appears
    /// or the scan window closes.
    async fn find_peripheral(&self, adapter: &Adapter) -> Result<Peripheral, LinkError> {
        let prefix = self.config.name_prefix.clone();
        let scan_window = Duration::from_secs(self.config.scan_timeout_secs);
        timeout(scan_window, async {
            loop {
                for p in adapter.peripherals().await.unwrap_or_default() {
                    if let Ok(Some(props)) = p.properties().await {
                        if props
                            .local_name
                            .as_deref()
                            .is_some_and(|name| name.starts_with(&prefix))
                        {
                            return p;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await
        .map_err(|_| LinkError::PeerNotFound)
    }
}

fn map_err(err: btleplug::Error) -> LinkError {
    use btleplug::Error as E;
    match err {
        E::DeviceNotFound => LinkError::PeerNotFound,
        E::PermissionDenied => LinkError::PairingRejected,
        E::NotConnected => LinkError::LinkDropped,
        E::TimedOut(_) => LinkError::Timeout,
        other => LinkError::Other(other.to_string()),
    }
}

#[async_trait]
impl DeviceLink for BleLink {
    async fn connect(&mut self) -> Result<String, LinkError> {
        let manager = Manager::new().await.map_err(map_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_err)?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Other("no Bluetooth adapter found".into()))?;

        // macOS: CBCentralManager starts in an "unknown" state right after
        // launch; scanning before it reports PoweredOn is a silent no-op.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => break,
                    Ok(_) if tokio::time::Instant::now() >= deadline => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            // Let the delegate settle before the actual RF scan.
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        info!(
            "scanning for '{}…' ({} s)",
            self.config.name_prefix, self.config.scan_timeout_secs
        );
        adapter
            .start_scan(ScanFilter {
                services: vec![HYDROMETER_SERVICE_UUID],
            })
            .await
            .map_err(map_err)?;
        let found = self.find_peripheral(&adapter).await;
        adapter.stop_scan().await.ok();
        let peripheral = found?;

        timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(map_err)?;

        // Linux (BlueZ): connection completion is signalled before the
        // remote GATT cache is populated; discovering too early returns an
        // empty service set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        let name = peripheral
            .properties()
            .await
            .map_err(map_err)?
            .and_then(|props| props.local_name)
            .unwrap_or_else(|| self.config.name_prefix.clone());
        info!("link established with {name}");

        self.peripheral = Some(peripheral);
        Ok(name)
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        if let Some(peripheral) = self.peripheral.take() {
            if let Err(err) = peripheral.disconnect().await {
                warn!("peripheral disconnect: {err}");
                return Err(map_err(err));
            }
        }
        Ok(())
    }

    async fn discover_characteristics(&mut self) -> Result<Vec<Uuid>, LinkError> {
        let peripheral = self.peripheral()?.clone();
        timeout(DISCOVERY_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(map_err)?;
        Ok(peripheral
            .characteristics()
            .into_iter()
            .map(|c| c.uuid)
            .collect())
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError> {
        let target = self.find_characteristic(characteristic)?;
        self.peripheral()?
            .subscribe(&target)
            .await
            .map_err(map_err)
    }

    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), LinkError> {
        let target = self.find_characteristic(characteristic)?;
        self.peripheral()?
            .write(&target, payload, WriteType::WithResponse)
            .await
            .map_err(map_err)
    }

    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        let target = self.find_characteristic(characteristic)?;
        self.peripheral()?.read(&target).await.map_err(map_err)
    }

    async fn notifications(&mut self) -> Result<BoxStream<'static, Notification>, LinkError> {
        let stream = self
            .peripheral()?
            .notifications()
            .await
            .map_err(map_err)?
            .map(|n| Notification {
                characteristic: n.uuid,
                value: n.value,
            });
        Ok(Box::pin(stream))
    }
}
