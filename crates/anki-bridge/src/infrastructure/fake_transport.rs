//! In-memory transport for tests and radio-less development.
//!
//! [`FakeTransport`] implements the transport capability traits without any
//! Bluetooth hardware.  Tests register [`FakePeripheral`]s, which are replayed
//! as advertisements whenever a scan starts, and then inspect what the bridge
//! did: every write, subscription and disconnect is recorded.
//!
//! Peripheral handles are the address string exactly as it was advertised, so
//! assertions can name a vehicle the same way the test registered it.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use anki_core::domain::gatt::{VEHICLE_CHARACTERISTIC_UUIDS, VEHICLE_SERVICE_UUID};

use crate::application::transport::{
    Advertisement, AdvertisementCallback, GattCharacteristic, NotificationCallback,
    PeripheralLink, Transport, TransportError,
};

// ── Peripheral description ────────────────────────────────────────────────────

/// A simulated vehicle.
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    pub address: String,
    pub local_name: Option<String>,
    pub manufacturer_data: Option<Vec<u8>>,
    /// Characteristic UUIDs exposed under the vehicle service.
    pub characteristics: Vec<Uuid>,
}

impl FakePeripheral {
    /// A well-formed vehicle named `Drive` exposing both characteristics.
    pub fn vehicle(address: &str) -> Self {
        Self {
            address: address.to_string(),
            local_name: Some("Drive".to_string()),
            manufacturer_data: None,
            characteristics: VEHICLE_CHARACTERISTIC_UUIDS.to_vec(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.local_name = Some(name.to_string());
        self
    }

    pub fn unnamed(mut self) -> Self {
        self.local_name = None;
        self
    }

    pub fn with_manufacturer_data(mut self, data: &[u8]) -> Self {
        self.manufacturer_data = Some(data.to_vec());
        self
    }

    pub fn without_characteristic(mut self, uuid: Uuid) -> Self {
        self.characteristics.retain(|c| *c != uuid);
        self
    }

    fn advertisement(&self) -> Advertisement<String> {
        Advertisement {
            address: self.address.clone(),
            local_name: self.local_name.clone(),
            manufacturer_data: self.manufacturer_data.clone(),
            peripheral: self.address.clone(),
        }
    }
}

// ── Shared recording state ────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    peripherals: Mutex<Vec<FakePeripheral>>,
    scan_callback: Mutex<Option<AdvertisementCallback<String>>>,
    scanning: AtomicBool,
    writes: Mutex<Vec<(String, Uuid, Vec<u8>)>>,
    subscribers: Mutex<HashMap<String, NotificationCallback>>,
    disconnects: Mutex<Vec<String>>,

    /// While set, characteristic discovery waits until the value is `true`.
    discovery_gate: Mutex<Option<watch::Sender<bool>>>,
    discoveries_waiting: AtomicUsize,

    enable_calls: AtomicUsize,
    stop_scan_calls: AtomicUsize,
    connect_calls: AtomicUsize,

    fail_enable: AtomicBool,
    fail_start_scan: AtomicBool,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_write: AtomicBool,
    fail_disconnect: AtomicBool,
}

fn failure(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// A [`Transport`] backed by in-memory peripherals.
#[derive(Clone, Default)]
pub struct FakeTransport {
    recorder: Arc<Recorder>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a vehicle visible to subsequent scans.
    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        self.recorder
            .peripherals
            .lock()
            .expect("lock poisoned")
            .push(peripheral);
    }

    /// Removes every vehicle from subsequent scans.
    pub fn clear_peripherals(&self) {
        self.recorder.peripherals.lock().expect("lock poisoned").clear();
    }

    /// Delivers `peripheral` to the most recent scan callback, even if that
    /// scan has already been stopped, the way a real stack may deliver a
    /// packet that was in flight.
    pub fn replay_last_callback(&self, peripheral: FakePeripheral) {
        let callback = self.recorder.scan_callback.lock().expect("lock poisoned").clone();
        if let Some(callback) = callback {
            callback(peripheral.advertisement());
        }
    }

    /// Pushes a notification from `address`.  Returns `false` if the bridge
    /// has not subscribed to that vehicle.
    pub fn notify(&self, address: &str, data: &[u8]) -> bool {
        let callback = self
            .recorder
            .subscribers
            .lock()
            .expect("lock poisoned")
            .get(address)
            .cloned();
        match callback {
            Some(callback) => {
                callback(data.to_vec());
                true
            }
            None => false,
        }
    }

    pub fn has_subscriber(&self, address: &str) -> bool {
        self.recorder
            .subscribers
            .lock()
            .expect("lock poisoned")
            .contains_key(address)
    }

    /// Payloads written to `address`, in order.
    pub fn writes_to(&self, address: &str) -> Vec<Vec<u8>> {
        self.all_writes()
            .into_iter()
            .filter(|(peripheral, _, _)| peripheral == address)
            .map(|(_, _, data)| data)
            .collect()
    }

    /// Every write as `(address, characteristic, payload)`.
    pub fn all_writes(&self) -> Vec<(String, Uuid, Vec<u8>)> {
        self.recorder.writes.lock().expect("lock poisoned").clone()
    }

    /// Addresses whose link was closed, in order.
    pub fn disconnects(&self) -> Vec<String> {
        self.recorder.disconnects.lock().expect("lock poisoned").clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.recorder.scanning.load(Ordering::SeqCst)
    }

    pub fn enable_calls(&self) -> usize {
        self.recorder.enable_calls.load(Ordering::SeqCst)
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.recorder.stop_scan_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.recorder.connect_calls.load(Ordering::SeqCst)
    }

    /// Makes every characteristic discovery wait until
    /// [`release_discovery`](Self::release_discovery), so a test can act
    /// while a CONNECT is half done.
    pub fn hold_discovery(&self) {
        let (gate, _) = watch::channel(false);
        *self.recorder.discovery_gate.lock().expect("lock poisoned") = Some(gate);
    }

    pub fn release_discovery(&self) {
        if let Some(gate) = self.recorder.discovery_gate.lock().expect("lock poisoned").take() {
            gate.send_replace(true);
        }
    }

    /// Discoveries currently held by [`hold_discovery`](Self::hold_discovery).
    pub fn discoveries_waiting(&self) -> usize {
        self.recorder.discoveries_waiting.load(Ordering::SeqCst)
    }

    pub fn set_fail_enable(&self, fail: bool) {
        self.recorder.fail_enable.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_start_scan(&self, fail: bool) {
        self.recorder.fail_start_scan.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.recorder.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.recorder.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_write(&self, fail: bool) {
        self.recorder.fail_write.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.recorder.fail_disconnect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Peripheral = String;
    type Link = FakeLink;

    async fn enable(&self) -> Result<(), TransportError> {
        self.recorder.enable_calls.fetch_add(1, Ordering::SeqCst);
        if failure(&self.recorder.fail_enable) {
            return Err(TransportError::AdapterUnavailable("radio off".into()));
        }
        Ok(())
    }

    async fn start_scan(
        &self,
        on_advertisement: AdvertisementCallback<String>,
    ) -> Result<(), TransportError> {
        if failure(&self.recorder.fail_start_scan) {
            return Err(TransportError::Scan("injected failure".into()));
        }
        *self.recorder.scan_callback.lock().expect("lock poisoned") =
            Some(Arc::clone(&on_advertisement));
        self.recorder.scanning.store(true, Ordering::SeqCst);

        let peripherals = self.recorder.peripherals.lock().expect("lock poisoned").clone();
        for peripheral in peripherals {
            on_advertisement(peripheral.advertisement());
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.recorder.stop_scan_calls.fetch_add(1, Ordering::SeqCst);
        self.recorder.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, peripheral: &String) -> Result<FakeLink, TransportError> {
        self.recorder.connect_calls.fetch_add(1, Ordering::SeqCst);
        if failure(&self.recorder.fail_connect) {
            return Err(TransportError::Connect("injected failure".into()));
        }
        let characteristics = self
            .recorder
            .peripherals
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|p| &p.address == peripheral)
            .map(|p| p.characteristics.clone())
            .ok_or_else(|| TransportError::Connect(format!("{peripheral} out of range")))?;

        Ok(FakeLink {
            peripheral: peripheral.clone(),
            characteristics,
            recorder: Arc::clone(&self.recorder),
        })
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// An open connection to a [`FakePeripheral`].
#[derive(Clone)]
pub struct FakeLink {
    peripheral: String,
    characteristics: Vec<Uuid>,
    recorder: Arc<Recorder>,
}

impl std::fmt::Debug for FakeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeLink")
            .field("peripheral", &self.peripheral)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PeripheralLink for FakeLink {
    type Characteristic = FakeCharacteristic;

    async fn discover_characteristics(
        &self,
        service: Uuid,
        wanted: &[Uuid],
    ) -> Result<Vec<FakeCharacteristic>, TransportError> {
        let gate = self
            .recorder
            .discovery_gate
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(watch::Sender::subscribe);
        if let Some(mut gate) = gate {
            self.recorder.discoveries_waiting.fetch_add(1, Ordering::SeqCst);
            let _ = gate.wait_for(|open| *open).await;
            self.recorder.discoveries_waiting.fetch_sub(1, Ordering::SeqCst);
        }

        if service != VEHICLE_SERVICE_UUID {
            return Err(TransportError::Discovery(format!("no service {service}")));
        }
        Ok(self
            .characteristics
            .iter()
            .filter(|uuid| wanted.contains(uuid))
            .map(|uuid| FakeCharacteristic {
                peripheral: self.peripheral.clone(),
                uuid: *uuid,
                recorder: Arc::clone(&self.recorder),
            })
            .collect())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.recorder
            .disconnects
            .lock()
            .expect("lock poisoned")
            .push(self.peripheral.clone());
        self.recorder
            .subscribers
            .lock()
            .expect("lock poisoned")
            .remove(&self.peripheral);
        if failure(&self.recorder.fail_disconnect) {
            return Err(TransportError::Disconnect("injected failure".into()));
        }
        Ok(())
    }
}

// ── Characteristic ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FakeCharacteristic {
    peripheral: String,
    uuid: Uuid,
    recorder: Arc<Recorder>,
}

impl std::fmt::Debug for FakeCharacteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeCharacteristic")
            .field("peripheral", &self.peripheral)
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl GattCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn write_without_response(&self, data: &[u8]) -> Result<(), TransportError> {
        if failure(&self.recorder.fail_write) {
            return Err(TransportError::Write("injected failure".into()));
        }
        self.recorder.writes.lock().expect("lock poisoned").push((
            self.peripheral.clone(),
            self.uuid,
            data.to_vec(),
        ));
        Ok(())
    }

    async fn enable_notifications(
        &self,
        on_data: NotificationCallback,
    ) -> Result<(), TransportError> {
        if failure(&self.recorder.fail_subscribe) {
            return Err(TransportError::Subscribe("injected failure".into()));
        }
        self.recorder
            .subscribers
            .lock()
            .expect("lock poisoned")
            .insert(self.peripheral.clone(), on_data);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use anki_core::domain::gatt::{VEHICLE_READ_UUID, VEHICLE_WRITE_UUID};

    #[tokio::test]
    async fn test_start_scan_replays_registered_peripherals() {
        // Arrange
        let transport = FakeTransport::new();
        transport.add_peripheral(FakePeripheral::vehicle("aa01"));
        transport.add_peripheral(FakePeripheral::vehicle("bb02").named("Other"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        // Act
        transport
            .start_scan(Arc::new(move |ad: Advertisement<String>| {
                sink.lock().unwrap().push((ad.address, ad.local_name));
            }))
            .await
            .unwrap();

        // Assert
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], ("bb02".to_string(), Some("Other".to_string())));
        assert!(transport.is_scanning());
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peripheral_fails() {
        let transport = FakeTransport::new();

        let result = transport.connect(&"aa01".to_string()).await;

        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_discovery_returns_only_wanted_characteristics() {
        let transport = FakeTransport::new();
        transport.add_peripheral(FakePeripheral::vehicle("aa01"));
        let link = transport.connect(&"aa01".to_string()).await.unwrap();

        let found = link
            .discover_characteristics(VEHICLE_SERVICE_UUID, &[VEHICLE_WRITE_UUID])
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uuid(), VEHICLE_WRITE_UUID);
    }

    #[tokio::test]
    async fn test_writes_and_notifications_are_recorded_per_peripheral() {
        // Arrange
        let transport = FakeTransport::new();
        transport.add_peripheral(FakePeripheral::vehicle("aa01"));
        let link = transport.connect(&"aa01".to_string()).await.unwrap();
        let chars = link
            .discover_characteristics(VEHICLE_SERVICE_UUID, &VEHICLE_CHARACTERISTIC_UUIDS)
            .await
            .unwrap();
        let notify = chars.iter().find(|c| c.uuid() == VEHICLE_READ_UUID).unwrap();
        let write = chars.iter().find(|c| c.uuid() == VEHICLE_WRITE_UUID).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        notify
            .enable_notifications(Arc::new(move |data: Vec<u8>| sink.lock().unwrap().push(data)))
            .await
            .unwrap();

        // Act
        write.write_without_response(&[0x01, 0x02]).await.unwrap();
        let delivered = transport.notify("aa01", &[0x0f]);

        // Assert
        assert_eq!(transport.writes_to("aa01"), vec![vec![0x01, 0x02]]);
        assert!(delivered);
        assert_eq!(*received.lock().unwrap(), vec![vec![0x0f]]);
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscription() {
        let transport = FakeTransport::new();
        transport.add_peripheral(FakePeripheral::vehicle("aa01"));
        let link = transport.connect(&"aa01".to_string()).await.unwrap();
        let chars = link
            .discover_characteristics(VEHICLE_SERVICE_UUID, &VEHICLE_CHARACTERISTIC_UUIDS)
            .await
            .unwrap();
        chars[0]
            .enable_notifications(Arc::new(|_data: Vec<u8>| {}))
            .await
            .unwrap();

        link.disconnect().await.unwrap();

        assert!(!transport.notify("aa01", &[0x01]));
        assert_eq!(transport.disconnects(), vec!["aa01".to_string()]);
    }

    #[tokio::test]
    async fn test_held_discovery_waits_for_release() {
        // Arrange
        let transport = FakeTransport::new();
        transport.add_peripheral(FakePeripheral::vehicle("aa01"));
        let link = transport.connect(&"aa01".to_string()).await.unwrap();
        transport.hold_discovery();

        // Act
        let pending = tokio::spawn(async move {
            link.discover_characteristics(VEHICLE_SERVICE_UUID, &VEHICLE_CHARACTERISTIC_UUIDS)
                .await
        });
        for _ in 0..100 {
            if transport.discoveries_waiting() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let waited = transport.discoveries_waiting();
        transport.release_discovery();
        let chars = pending.await.unwrap().unwrap();

        // Assert
        assert_eq!(waited, 1);
        assert_eq!(chars.len(), 2);
        assert_eq!(transport.discoveries_waiting(), 0);
    }
}
