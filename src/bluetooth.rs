//! [`Transport`] over the host Bluetooth stack using `btleplug`.
//!
//! # Example
//!
//! ```no_run
//! use jkbms_lib::bluetooth::BtleplugTransport;
//! use jkbms_lib::clock::TokioClock;
//! use jkbms_lib::config::EngineConfig;
//! use jkbms_lib::manager::SessionManager;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = BtleplugTransport::new().await?;
//!     let config = EngineConfig::with_devices(["c8:47:80:31:9b:02"]);
//!     let mut manager = SessionManager::new(config, transport, TokioClock)?;
//!     manager.run(async { tokio::signal::ctrl_c().await.unwrap_or(()) }).await;
//!     Ok(())
//! }
//! ```

use crate::config::ConnectionParams;
use crate::registry::MacAddress;
use crate::transport::{Discovered, NotificationSink, Result, Transport, TransportError};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => TransportError::DeviceNotFound,
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::TimedOut(_) => TransportError::Timeout,
            other => TransportError::Backend(other.to_string()),
        }
    }
}

impl From<BDAddr> for MacAddress {
    fn from(address: BDAddr) -> Self {
        MacAddress::new(address.into_inner())
    }
}

/// An open connection to one peripheral.
#[derive(Debug)]
pub struct BtleplugLink {
    peripheral: Peripheral,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound)
    }

    fn stop_listener(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

#[derive(Debug)]
pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Uses the first adapter reported by the platform.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Backend("no Bluetooth adapter found".into()))?;
        if let Ok(info) = adapter.adapter_info().await {
            log::info!("Using adapter {info}");
        }
        Ok(Self { adapter })
    }

    async fn find_peripheral(&self, address: MacAddress) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            if MacAddress::from(peripheral.address()) == address {
                return Ok(peripheral);
            }
        }
        Err(TransportError::DeviceNotFound)
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Link = BtleplugLink;

    async fn scan(&self, duration: Duration) -> Result<Vec<Discovered>> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;
        if let Err(err) = self.adapter.stop_scan().await {
            log::debug!("Stopping scan failed: {err}");
        }

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            found.push(Discovered {
                address: properties.address.into(),
                name: properties.local_name,
                rssi: properties.rssi,
            });
        }
        Ok(found)
    }

    async fn connect(&self, address: MacAddress, params: &ConnectionParams) -> Result<Self::Link> {
        log::trace!(
            "{address}: requested interval {}..{} latency {} supervision timeout {}",
            params.min_interval,
            params.max_interval,
            params.latency,
            params.supervision_timeout
        );
        let peripheral = self.find_peripheral(address).await?;
        if !peripheral.is_connected().await? {
            peripheral
                .connect()
                .await
                .map_err(|err| TransportError::ConnectFailed(err.to_string()))?;
        }
        Ok(BtleplugLink {
            peripheral,
            listener: Mutex::new(None),
        })
    }

    async fn find_service(&self, link: &Self::Link, service: Uuid) -> Result<bool> {
        link.peripheral.discover_services().await?;
        Ok(link
            .peripheral
            .services()
            .iter()
            .any(|candidate| candidate.uuid == service))
    }

    async fn find_characteristic(
        &self,
        link: &Self::Link,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<bool> {
        Ok(link.peripheral.characteristics().iter().any(|candidate| {
            candidate.service_uuid == service
                && candidate.uuid == characteristic
                && candidate.properties.contains(CharPropFlags::NOTIFY)
        }))
    }

    async fn subscribe(
        &self,
        link: &Self::Link,
        characteristic: Uuid,
        sink: NotificationSink,
    ) -> Result<()> {
        let target = link.characteristic(characteristic)?;
        let mut notifications = link
            .peripheral
            .notifications()
            .await
            .map_err(|err| TransportError::SubscribeFailed(err.to_string()))?;
        link.peripheral
            .subscribe(&target)
            .await
            .map_err(|err| TransportError::SubscribeFailed(err.to_string()))?;

        let listener = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic && !sink.forward(&notification.value).await
                {
                    return;
                }
            }
            log::debug!("{}: notification stream ended", sink.address());
            sink.disconnected().await;
        });
        let previous = link
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(listener);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn write(&self, link: &Self::Link, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let target = link.characteristic(characteristic)?;
        link.peripheral
            .write(&target, data, WriteType::WithoutResponse)
            .await
            .map_err(|err| TransportError::WriteFailed(err.to_string()))
    }

    async fn disconnect(&self, link: &Self::Link) -> Result<()> {
        link.stop_listener();
        if link.peripheral.is_connected().await? {
            link.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
