//! Capability traits for the Bluetooth LE stack.
//!
//! The application layer never talks to a radio directly.  Everything it needs
//! from the stack is expressed by three traits:
//!
//! - [`Transport`] – the adapter: power-up, advertisement observation and
//!   opening connections.
//! - [`PeripheralLink`] – one open connection to a vehicle.
//! - [`GattCharacteristic`] – one characteristic on that connection.
//!
//! Handles are associated types rather than trait objects, so a link returned
//! by a transport is always the concrete type that transport understands and
//! no downcasting is needed when it is handed back.
//!
//! The production implementation lives in `infrastructure::ble`; tests use
//! `infrastructure::fake_transport`.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures reported by a transport implementation.
///
/// The string payload is the stack's own description; the application layer
/// only logs it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("service discovery failed: {0}")]
    Discovery(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("notification subscribe failed: {0}")]
    Subscribe(String),

    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

// ── Callback types ────────────────────────────────────────────────────────────

/// One advertisement seen while observing.
#[derive(Debug, Clone)]
pub struct Advertisement<P> {
    /// Address as the stack reports it (any separator style).
    pub address: String,
    /// Advertised local name, if the packet carried one.
    pub local_name: Option<String>,
    /// Manufacturer-specific data, if the packet carried any.
    pub manufacturer_data: Option<Vec<u8>>,
    /// Handle to pass back to [`Transport::connect`].
    pub peripheral: P,
}

/// Invoked by the transport for each advertisement while a scan is running.
///
/// May be called from any thread and concurrently with itself.
pub type AdvertisementCallback<P> = Arc<dyn Fn(Advertisement<P>) + Send + Sync>;

/// Invoked by the transport for each notification on a characteristic.
///
/// Must return quickly; it runs on the stack's delivery path.
pub type NotificationCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// The characteristic type reachable from a transport.
pub type CharacteristicOf<T> = <<T as Transport>::Link as PeripheralLink>::Characteristic;

// ── Traits ────────────────────────────────────────────────────────────────────

/// The local Bluetooth adapter.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opaque handle identifying a peripheral seen during a scan.
    type Peripheral: Clone + Debug + Send + Sync + 'static;

    /// Open connection produced by [`Transport::connect`].
    type Link: PeripheralLink;

    /// Brings the radio up.  Callers invoke this once before the first scan.
    async fn enable(&self) -> Result<(), TransportError>;

    /// Starts observing advertisements.  Returns once observation is running;
    /// `on_advertisement` keeps firing until [`Transport::stop_scan`].
    async fn start_scan(
        &self,
        on_advertisement: AdvertisementCallback<Self::Peripheral>,
    ) -> Result<(), TransportError>;

    /// Stops observation.  Stopping when no scan is running is not an error.
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Opens a connection to a previously observed peripheral.
    async fn connect(&self, peripheral: &Self::Peripheral) -> Result<Self::Link, TransportError>;
}

/// One open connection to a vehicle.
#[async_trait]
pub trait PeripheralLink: Clone + Debug + Send + Sync + 'static {
    type Characteristic: GattCharacteristic;

    /// Discovers `service` and then the characteristics listed in `wanted`.
    ///
    /// Returns whatever subset of `wanted` the peripheral exposes, in the
    /// stack's order.  Role assignment is the caller's job.
    async fn discover_characteristics(
        &self,
        service: Uuid,
        wanted: &[Uuid],
    ) -> Result<Vec<Self::Characteristic>, TransportError>;

    /// Closes the connection.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// One GATT characteristic on an open link.
#[async_trait]
pub trait GattCharacteristic: Clone + Debug + Send + Sync + 'static {
    fn uuid(&self) -> Uuid;

    /// Writes `data` without waiting for a GATT acknowledgement.
    async fn write_without_response(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Subscribes to notifications; `on_data` fires for every value pushed.
    async fn enable_notifications(
        &self,
        on_data: NotificationCallback,
    ) -> Result<(), TransportError>;
}
