//! The link layer the session manager drives.
//!
//! A [`Transport`] scans, connects and talks to one characteristic per
//! peripheral. Notifications and disconnects are not returned from these
//! calls; the transport pushes them through the [`NotificationSink`] it was
//! handed on subscribe. The manager applies them between lifecycle steps and
//! during every pause inside a connection cycle.

use crate::config::ConnectionParams;
use crate::registry::MacAddress;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Errors reported by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Device not found")]
    DeviceNotFound,
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Operation timed out")]
    Timeout,
    #[error("Service not found")]
    ServiceNotFound,
    #[error("Characteristic not found")]
    CharacteristicNotFound,
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A specialized `Result` type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// A peripheral reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub address: MacAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Pushed by the transport, consumed by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification { address: MacAddress, data: Vec<u8> },
    Disconnected { address: MacAddress },
}

/// Delivery handle for one subscribed peripheral.
///
/// [`deliver`](Self::deliver) never blocks and drops the notification when the
/// queue is full. Transports running their own task should use
/// [`forward`](Self::forward), which waits for room instead.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    address: MacAddress,
    tx: mpsc::Sender<TransportEvent>,
}

impl NotificationSink {
    pub fn new(address: MacAddress, tx: mpsc::Sender<TransportEvent>) -> Self {
        Self { address, tx }
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    fn notification(&self, data: &[u8]) -> TransportEvent {
        TransportEvent::Notification {
            address: self.address,
            data: data.to_vec(),
        }
    }

    /// Queues a notification without waiting. Returns `false` if it was dropped.
    pub fn deliver(&self, data: &[u8]) -> bool {
        match self.tx.try_send(self.notification(data)) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                log::warn!("{}: event queue full, dropping {event:?}", self.address);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("{}: event queue closed", self.address);
                false
            }
        }
    }

    /// Queues a notification, waiting while the queue is full.
    /// Returns `false` once the manager is gone.
    pub async fn forward(&self, data: &[u8]) -> bool {
        self.send(self.notification(data)).await
    }

    /// Reports that the link went down. Waits for room, so it is never
    /// dropped while the manager is alive.
    pub async fn disconnected(&self) -> bool {
        self.send(TransportEvent::Disconnected {
            address: self.address,
        })
        .await
    }

    async fn send(&self, event: TransportEvent) -> bool {
        if self.tx.send(event).await.is_err() {
            log::debug!("{}: event queue closed", self.address);
            return false;
        }
        true
    }
}

/// Operations the session manager needs from a link layer backend.
///
/// Every call may fail; the manager treats all failures as recoverable.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection handle for one peripheral.
    type Link: Send + Sync;

    async fn scan(&self, duration: Duration) -> Result<Vec<Discovered>>;

    async fn connect(&self, address: MacAddress, params: &ConnectionParams) -> Result<Self::Link>;

    /// Discovers services and reports whether `service` is present.
    async fn find_service(&self, link: &Self::Link, service: Uuid) -> Result<bool>;

    async fn find_characteristic(
        &self,
        link: &Self::Link,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<bool>;

    /// Enables notifications on `characteristic`, delivering them to `sink`.
    async fn subscribe(
        &self,
        link: &Self::Link,
        characteristic: Uuid,
        sink: NotificationSink,
    ) -> Result<()>;

    async fn write(&self, link: &Self::Link, characteristic: Uuid, data: &[u8]) -> Result<()>;

    async fn disconnect(&self, link: &Self::Link) -> Result<()>;
}
