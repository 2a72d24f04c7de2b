//! Bluetooth LE transport backed by `btleplug`.
//!
//! `btleplug` exposes the platform stacks (BlueZ over D-Bus on Linux,
//! CoreBluetooth on macOS, WinRT on Windows) through one async API.  This
//! module adapts that API to the bridge's [`Transport`] capability:
//!
//! | Capability                  | btleplug                                   |
//! |-----------------------------|--------------------------------------------|
//! | `enable`                    | `Adapter::adapter_info`                    |
//! | `start_scan` / `stop_scan`  | `Adapter::events` + `start_scan(ScanFilter)` |
//! | `connect`                   | `Peripheral::connect`                      |
//! | `discover_characteristics`  | `discover_services` + `characteristics()`  |
//! | `write_without_response`    | `write(…, WriteType::WithoutResponse)`     |
//! | `enable_notifications`      | `notifications()` stream + `subscribe`     |
//!
//! Event and notification streams are drained by background tasks that call
//! the bridge's callbacks; the tasks are aborted on `stop_scan` and
//! `disconnect` respectively.
//!
//! # Addresses on macOS
//!
//! CoreBluetooth hides hardware addresses and reports `00:00:00:00:00:00`.
//! In that case the peripheral id (a UUID) is used instead; it normalizes to
//! 32 hex digits and is stable for the lifetime of the host pairing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::transport::{
    Advertisement, AdvertisementCallback, GattCharacteristic, NotificationCallback,
    PeripheralLink, Transport, TransportError,
};

/// Bluetooth SIG company identifier used by Anki vehicles.
pub const ANKI_COMPANY_ID: u16 = 0xBEEF;

type TaskSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

/// Replaces the task in `slot`, aborting the one it held.
fn replace_task(slot: &TaskSlot, task: Option<JoinHandle<()>>) {
    let previous = {
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, task)
    };
    if let Some(previous) = previous {
        previous.abort();
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// [`Transport`] over the first Bluetooth adapter of the host.
pub struct BtleplugTransport {
    adapter: Adapter,
    scan_task: TaskSlot,
}

impl BtleplugTransport {
    /// Opens the platform manager and selects the first adapter.
    ///
    /// # Errors
    ///
    /// [`TransportError::AdapterUnavailable`] if the Bluetooth stack cannot
    /// be reached or the host has no adapter.
    pub async fn first_adapter() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::AdapterUnavailable("no Bluetooth adapter found".into()))?;

        Ok(Self {
            adapter,
            scan_task: Arc::new(Mutex::new(None)),
        })
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Peripheral = Peripheral;
    type Link = BtleplugLink;

    async fn enable(&self) -> Result<(), TransportError> {
        let info = self
            .adapter
            .adapter_info()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        info!("using Bluetooth adapter {info}");
        Ok(())
    }

    async fn start_scan(
        &self,
        on_advertisement: AdvertisementCallback<Peripheral>,
    ) -> Result<(), TransportError> {
        // Subscribe before scanning so the first packets are not lost.
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;

        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                    _ => continue,
                };
                match advertisement_for(&adapter, &id).await {
                    Ok(Some(advertisement)) => on_advertisement(advertisement),
                    Ok(None) => {}
                    Err(e) => debug!("could not read properties of {id}: {e}"),
                }
            }
        });
        replace_task(&self.scan_task, Some(task));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        replace_task(&self.scan_task, None);
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<BtleplugLink, TransportError> {
        let connected = peripheral
            .is_connected()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !connected {
            peripheral
                .connect()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        }
        Ok(BtleplugLink {
            peripheral: peripheral.clone(),
            notify_task: Arc::new(Mutex::new(None)),
        })
    }
}

/// Reads the current properties of `id` and shapes them as an advertisement.
async fn advertisement_for(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<Option<Advertisement<Peripheral>>, btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };

    Ok(Some(Advertisement {
        address: reported_address(properties.address, || id.to_string()),
        local_name: properties.local_name,
        manufacturer_data: pick_manufacturer_data(&properties.manufacturer_data),
        peripheral,
    }))
}

/// The hardware address, or `fallback()` when the stack hides it.
fn reported_address(address: BDAddr, fallback: impl FnOnce() -> String) -> String {
    if address == BDAddr::default() {
        fallback()
    } else {
        address.to_string()
    }
}

/// Chooses the manufacturer payload to report.
///
/// The Anki company entry wins; otherwise the entry with the lowest company
/// id, so the choice is stable across advertisements.
fn pick_manufacturer_data(entries: &HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
    entries
        .get(&ANKI_COMPANY_ID)
        .or_else(|| {
            entries
                .iter()
                .min_by_key(|(company, _)| **company)
                .map(|(_, data)| data)
        })
        .cloned()
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// An open connection to one vehicle.
#[derive(Debug, Clone)]
pub struct BtleplugLink {
    peripheral: Peripheral,
    notify_task: TaskSlot,
}

#[async_trait]
impl PeripheralLink for BtleplugLink {
    type Characteristic = BtleplugCharacteristic;

    async fn discover_characteristics(
        &self,
        service: Uuid,
        wanted: &[Uuid],
    ) -> Result<Vec<BtleplugCharacteristic>, TransportError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))?;

        if !self.peripheral.services().iter().any(|s| s.uuid == service) {
            return Err(TransportError::Discovery(format!(
                "service {service} not offered"
            )));
        }

        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service && wanted.contains(&c.uuid))
            .map(|characteristic| BtleplugCharacteristic {
                peripheral: self.peripheral.clone(),
                characteristic,
                notify_task: Arc::clone(&self.notify_task),
            })
            .collect())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        replace_task(&self.notify_task, None);
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))
    }
}

// ── Characteristic ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BtleplugCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
    notify_task: TaskSlot,
}

#[async_trait]
impl GattCharacteristic for BtleplugCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    async fn write_without_response(&self, data: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.characteristic, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn enable_notifications(
        &self,
        on_data: NotificationCallback,
    ) -> Result<(), TransportError> {
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let uuid = self.characteristic.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid {
                    on_data(notification.value);
                }
            }
            warn!("notification stream for {uuid} ended");
        });
        replace_task(&self.notify_task, Some(task));
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
