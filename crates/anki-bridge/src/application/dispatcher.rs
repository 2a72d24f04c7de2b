//! Command dispatcher: the protocol state machine.
//!
//! Every inbound frame is handed to [`CommandDispatcher::dispatch`] on its own
//! task.  The dispatcher is stateless apart from the shared [`BridgeState`];
//! it parses the frame, runs the matching operation and writes the reply (if
//! the protocol has one) to the session's [`FrameSink`].
//!
//! | Frame                  | Operation                  | Reply                    |
//! |------------------------|----------------------------|--------------------------|
//! | contains `SCAN`        | [`CommandDispatcher::scan`]       | `SCAN;…` × N, `SCAN;COMPLETED` |
//! | contains `DISCONNECT`  | [`CommandDispatcher::disconnect`] | `DISCONNECT;SUCCESS/ERROR` |
//! | field 0 has `CONNECT`  | [`CommandDispatcher::connect`]    | `CONNECT;SUCCESS/ERROR`  |
//! | `<address>;<hex>`      | [`CommandDispatcher::forward`]    | none                     |
//!
//! Operation failures are typed ([`DispatchError`]), logged, and mapped to the
//! protocol's failure frame.  Nothing in here terminates the process.
//!
//! Frames carry the teardown epoch that was current when they were read (see
//! [`BridgeState::begin_teardown`]).  A CONNECT read before a teardown began
//! is refused once it reaches the registries, so a session that has gone away
//! cannot leave a vehicle connected behind it.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use anki_core::domain::gatt::{VEHICLE_CHARACTERISTIC_UUIDS, VEHICLE_SERVICE_UUID};
use anki_core::protocol::decode_payload;
use anki_core::{
    AddressError, CharacteristicPair, Command, DeviceAddress, MissingCharacteristic,
    ProtocolError, Response,
};

use super::discovery::{DiscoveryEngine, DiscoveryError};
use super::relay::{FrameSink, NotificationRelay, SinkError};
use super::state::{BridgeState, ConnectedDevice};
use super::transport::{GattCharacteristic, PeripheralLink, Transport, TransportError};
use crate::domain::BridgeConfig;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a single command failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("command carries no device address")]
    MissingAddress,

    #[error(transparent)]
    InvalidAddress(#[from] AddressError),

    #[error("device {0} was not found by the last scan")]
    NotDiscovered(DeviceAddress),

    #[error("device {0} is already connected")]
    AlreadyConnected(DeviceAddress),

    #[error("device {0} is not connected")]
    NotConnected(DeviceAddress),

    #[error("connection to {0} was interrupted by a session teardown")]
    TornDown(DeviceAddress),

    #[error(transparent)]
    MissingCharacteristic(#[from] MissingCharacteristic),

    #[error(transparent)]
    Payload(#[from] ProtocolError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Routes parsed commands to operations on the shared state.
pub struct CommandDispatcher<T: Transport> {
    transport: Arc<T>,
    state: Arc<BridgeState<T>>,
    discovery: Arc<DiscoveryEngine<T>>,
    config: Arc<BridgeConfig>,
}

impl<T: Transport> CommandDispatcher<T> {
    pub fn new(
        transport: Arc<T>,
        state: Arc<BridgeState<T>>,
        discovery: Arc<DiscoveryEngine<T>>,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            transport,
            state,
            discovery,
            config,
        }
    }

    pub fn state(&self) -> &Arc<BridgeState<T>> {
        &self.state
    }

    /// Parses and executes one frame, replying on `sink`.
    pub async fn dispatch(&self, frame: &[u8], sink: Arc<dyn FrameSink>) {
        let epoch = self.state.teardown_epoch();
        self.dispatch_since(frame, sink, epoch).await;
    }

    /// Like [`dispatch`](Self::dispatch) for a frame read at teardown
    /// `epoch`.
    pub async fn dispatch_since(&self, frame: &[u8], sink: Arc<dyn FrameSink>, epoch: u64) {
        let command = Command::parse(frame);
        debug!("dispatching {} frame", command.name());

        let result = match command {
            Command::Scan => self.scan(sink.as_ref()).await,
            Command::Disconnect { address } => {
                let reply = match self.disconnect(address.as_deref()).await {
                    Ok(()) => Response::DisconnectSuccess,
                    Err(e) => {
                        warn!("DISCONNECT failed: {e}");
                        Response::DisconnectError
                    }
                };
                sink.send(&reply).await.map_err(DispatchError::from)
            }
            Command::Connect { address } => {
                let connected = self
                    .connect_since(address.as_deref(), Arc::clone(&sink), epoch)
                    .await;
                let reply = match connected {
                    Ok(()) => Response::ConnectSuccess,
                    Err(e) => {
                        warn!("CONNECT failed: {e}");
                        Response::ConnectError
                    }
                };
                sink.send(&reply).await.map_err(DispatchError::from)
            }
            Command::Raw {
                address,
                payload_hex,
            } => self.forward(&address, &payload_hex).await,
            Command::Ignored => {
                debug!("ignoring unrecognised frame");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("command dropped: {e}");
        }
    }

    // ── SCAN ──────────────────────────────────────────────────────────────────

    /// Scans, replaces the discovered-set and reports every vehicle.
    ///
    /// Always ends with `SCAN;COMPLETED`, even when the radio failed, so the
    /// SDK's scan loop terminates.
    pub async fn scan(&self, sink: &dyn FrameSink) -> Result<(), DispatchError> {
        let devices = match self.discovery.scan(self.config.scan_timeout).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("scan failed: {e}");
                Default::default()
            }
        };
        let report = devices.sorted_items();
        self.state.replace_discovered(devices);

        for (index, (_, record)) in report.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.scan_report_interval).await;
            }
            sink.send(&Response::ScanResult {
                address: record.address,
                manufacturer_data: record.manufacturer_data,
                display_name: record.display_name,
            })
            .await?;
        }

        sink.send(&Response::ScanCompleted).await?;
        Ok(())
    }

    // ── CONNECT ───────────────────────────────────────────────────────────────

    /// Connects to a discovered vehicle and starts relaying its notifications
    /// to `sink`.
    ///
    /// On any failure nothing is left behind: the link is closed best-effort
    /// and no registry entry is created.
    pub async fn connect(
        &self,
        raw_address: Option<&str>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<(), DispatchError> {
        let epoch = self.state.teardown_epoch();
        self.connect_since(raw_address, sink, epoch).await
    }

    async fn connect_since(
        &self,
        raw_address: Option<&str>,
        sink: Arc<dyn FrameSink>,
        epoch: u64,
    ) -> Result<(), DispatchError> {
        let address = parse_address(raw_address)?;
        let record = self
            .state
            .discovered_device(&address)
            .ok_or_else(|| DispatchError::NotDiscovered(address.clone()))?;

        let lock = self.state.address_lock(&address);
        let _guard = lock.lock().await;

        if self.state.connected.contains(&address) {
            return Err(DispatchError::AlreadyConnected(address));
        }

        info!("connecting to {address}");
        let link = self.transport.connect(&record.handle).await?;

        match self.attach(&address, &link, sink, epoch).await {
            Ok(()) => {
                info!("connected to {address}");
                Ok(())
            }
            Err(e) => {
                if let Err(close) = link.disconnect().await {
                    debug!("rollback disconnect of {address} failed: {close}");
                }
                Err(e)
            }
        }
    }

    /// Everything after the link is open: characteristics, relay, registries.
    async fn attach(
        &self,
        address: &DeviceAddress,
        link: &T::Link,
        sink: Arc<dyn FrameSink>,
        epoch: u64,
    ) -> Result<(), DispatchError> {
        let discovered = link
            .discover_characteristics(VEHICLE_SERVICE_UUID, &VEHICLE_CHARACTERISTIC_UUIDS)
            .await?;
        let pair = CharacteristicPair::assign(discovered, |c| c.uuid())?;

        let (on_data, relay) =
            NotificationRelay::spawn(address.clone(), sink, self.config.relay_queue_depth);
        if let Err(e) = pair.notify.enable_notifications(on_data).await {
            relay.abort();
            return Err(e.into());
        }

        // The address lock is held and already registered, so a teardown
        // that starts after this check waits for it and removes the entry.
        if self.state.teardown_epoch() != epoch {
            relay.abort();
            return Err(DispatchError::TornDown(address.clone()));
        }

        self.state.characteristics.set(address.clone(), pair);
        self.state.connected.set(
            address.clone(),
            ConnectedDevice {
                link: link.clone(),
                relay: relay.abort_handle(),
            },
        );
        Ok(())
    }

    // ── DISCONNECT ────────────────────────────────────────────────────────────

    /// Disconnects a connected vehicle.
    ///
    /// Registries are cleared and the relay stopped before the link is
    /// closed, so even a failed close leaves no stale state.
    pub async fn disconnect(&self, raw_address: Option<&str>) -> Result<(), DispatchError> {
        let address = parse_address(raw_address)?;

        let lock = self.state.address_lock(&address);
        let _guard = lock.lock().await;

        let entry = self
            .state
            .forget_connection(&address)
            .ok_or_else(|| DispatchError::NotConnected(address.clone()))?;
        entry.relay.abort();

        info!("disconnecting from {address}");
        entry.link.disconnect().await?;
        Ok(())
    }

    /// Closes every connected vehicle and clears both connection registries.
    ///
    /// Used on session teardown and shutdown.  Each address is visited under
    /// its lock, so a CONNECT in flight is waited for and then either refused
    /// (it started before this teardown) or removed here.  Close failures are
    /// logged.
    pub async fn disconnect_all(&self) {
        let epoch = self.state.begin_teardown();
        debug!("teardown {epoch} started");

        for address in self.state.locked_addresses() {
            let lock = self.state.address_lock(&address);
            let _guard = lock.lock().await;

            let Some(entry) = self.state.forget_connection(&address) else {
                continue;
            };
            entry.relay.abort();
            match entry.link.disconnect().await {
                Ok(()) => info!("disconnected {address}"),
                Err(e) => warn!("failed to disconnect {address}: {e}"),
            }
        }
    }

    // ── Raw command ───────────────────────────────────────────────────────────

    /// Writes a hex payload to a connected vehicle's write characteristic.
    ///
    /// Fire-and-forget: no reply is sent on success or failure.
    pub async fn forward(&self, raw_address: &str, payload_hex: &str) -> Result<(), DispatchError> {
        let address = DeviceAddress::normalize(raw_address)?;
        let pair = self
            .state
            .characteristics
            .get(&address)
            .ok_or_else(|| DispatchError::NotConnected(address.clone()))?;
        let payload = decode_payload(payload_hex)?;

        debug!("writing to {address}: {payload_hex}");
        pair.write.write_without_response(&payload).await?;
        Ok(())
    }
}

fn parse_address(raw: Option<&str>) -> Result<DeviceAddress, DispatchError> {
    let raw = raw.ok_or(DispatchError::MissingAddress)?;
    Ok(DeviceAddress::normalize(raw)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::infrastructure::fake_transport::{FakePeripheral, FakeTransport};
    use anki_core::domain::gatt::VEHICLE_READ_UUID;

    // ── Test doubles ──────────────────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&self, response: &Response) -> Result<(), SinkError> {
            self.frames.lock().unwrap().push(response.encode());
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Arc<CommandDispatcher<FakeTransport>>,
        transport: Arc<FakeTransport>,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new(peripherals: Vec<FakePeripheral>) -> Self {
            let transport = Arc::new(FakeTransport::new());
            for peripheral in peripherals {
                transport.add_peripheral(peripheral);
            }
            let config = BridgeConfig {
                scan_timeout: Duration::from_millis(20),
                scan_report_interval: Duration::from_millis(1),
                ..BridgeConfig::default()
            };
            let dispatcher = Arc::new(CommandDispatcher::new(
                Arc::clone(&transport),
                Arc::new(BridgeState::new()),
                Arc::new(DiscoveryEngine::new(Arc::clone(&transport))),
                Arc::new(config),
            ));
            Self {
                dispatcher,
                transport,
                sink: Arc::new(RecordingSink::default()),
            }
        }

        async fn send(&self, frame: &[u8]) {
            let sink = Arc::clone(&self.sink) as Arc<dyn FrameSink>;
            self.dispatcher.dispatch(frame, sink).await;
        }

        fn state(&self) -> &BridgeState<FakeTransport> {
            self.dispatcher.state()
        }

        /// Starts a CONNECT on its own task.
        fn spawn_connect(
            &self,
            address: &'static str,
        ) -> tokio::task::JoinHandle<Result<(), DispatchError>> {
            let dispatcher = Arc::clone(&self.dispatcher);
            let sink = Arc::clone(&self.sink) as Arc<dyn FrameSink>;
            tokio::spawn(async move { dispatcher.connect(Some(address), sink).await })
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn addr(raw: &str) -> DeviceAddress {
        DeviceAddress::normalize(raw).unwrap()
    }

    // ── SCAN ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_scan_with_no_vehicles_replies_completed_only() {
        let h = Harness::new(vec![]);

        h.send(b"SCAN\n").await;

        assert_eq!(h.sink.frames(), vec!["SCAN;COMPLETED\n"]);
    }

    #[tokio::test]
    async fn test_scan_reports_each_vehicle_then_completed() {
        // Arrange
        let h = Harness::new(vec![
            FakePeripheral::vehicle("bb02"),
            FakePeripheral::vehicle("aa01").with_manufacturer_data(&[0x01, 0x02]),
        ]);

        // Act
        h.send(b"SCAN").await;

        // Assert
        assert_eq!(
            h.sink.frames(),
            vec![
                "SCAN;aa01;beef0102;10603001202020204472697665\n",
                "SCAN;bb02;;10603001202020204472697665\n",
                "SCAN;COMPLETED\n",
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_failure_still_replies_completed() {
        let h = Harness::new(vec![FakePeripheral::vehicle("aa01")]);
        h.transport.set_fail_enable(true);

        h.send(b"SCAN\n").await;

        assert_eq!(h.sink.frames(), vec!["SCAN;COMPLETED\n"]);
        assert!(h.state().discovered().is_empty());
    }

    #[tokio::test]
    async fn test_second_scan_replaces_discovered_set() {
        // Arrange
        let h = Harness::new(vec![FakePeripheral::vehicle("aa01")]);
        h.send(b"SCAN\n").await;

        // Act: aa01 has left, bb02 has arrived
        h.transport.clear_peripherals();
        h.transport.add_peripheral(FakePeripheral::vehicle("bb02"));
        h.send(b"SCAN\n").await;

        // Assert
        assert!(h.state().discovered_device(&addr("aa01")).is_none());
        assert!(h.state().discovered_device(&addr("bb02")).is_some());
    }

    // ── CONNECT ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_to_discovered_vehicle_succeeds() {
        // Arrange
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;

        // Act
        h.send(b"CONNECT;abc123\0\0\0\n").await;

        // Assert
        assert_eq!(h.sink.frames().last().unwrap(), "CONNECT;SUCCESS\n");
        assert!(h.state().connected.contains(&addr("abc123")));
        assert!(h.state().characteristics.contains(&addr("abc123")));
        assert!(h.transport.has_subscriber("abc123"));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_vehicle_fails_fast() {
        let h = Harness::new(vec![]);

        h.send(b"CONNECT;abc123\n").await;

        assert_eq!(h.sink.frames(), vec!["CONNECT;ERROR\n"]);
        assert_eq!(h.transport.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_without_address_fails() {
        let h = Harness::new(vec![]);

        h.send(b"CONNECT\n").await;

        assert_eq!(h.sink.frames(), vec!["CONNECT;ERROR\n"]);
    }

    #[tokio::test]
    async fn test_connect_twice_keeps_first_connection() {
        // Arrange
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.send(b"CONNECT;abc123\n").await;

        // Act
        h.send(b"CONNECT;abc123\n").await;

        // Assert
        let frames = h.sink.frames();
        assert_eq!(frames[frames.len() - 2], "CONNECT;SUCCESS\n");
        assert_eq!(frames[frames.len() - 1], "CONNECT;ERROR\n");
        assert_eq!(h.transport.connect_calls(), 1);
        assert!(h.transport.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_connect_transport_failure_leaves_no_state() {
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.transport.set_fail_connect(true);

        h.send(b"CONNECT;abc123\n").await;

        assert_eq!(h.sink.frames().last().unwrap(), "CONNECT;ERROR\n");
        assert!(h.state().connected.is_empty());
        assert!(h.state().characteristics.is_empty());
    }

    #[tokio::test]
    async fn test_connect_missing_notify_characteristic_rolls_back() {
        // Arrange: a vehicle exposing only the write characteristic
        let h = Harness::new(vec![
            FakePeripheral::vehicle("abc123").without_characteristic(VEHICLE_READ_UUID)
        ]);
        h.send(b"SCAN\n").await;

        // Act
        h.send(b"CONNECT;abc123\n").await;

        // Assert
        assert_eq!(h.sink.frames().last().unwrap(), "CONNECT;ERROR\n");
        assert!(h.state().connected.is_empty());
        assert!(h.state().characteristics.is_empty());
        assert_eq!(h.transport.disconnects(), vec!["abc123".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_subscribe_failure_rolls_back() {
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.transport.set_fail_subscribe(true);

        h.send(b"CONNECT;abc123\n").await;

        assert_eq!(h.sink.frames().last().unwrap(), "CONNECT;ERROR\n");
        assert!(h.state().characteristics.is_empty());
        assert_eq!(h.transport.disconnects(), vec!["abc123".to_string()]);
    }

    #[tokio::test]
    async fn test_notification_after_connect_reaches_sink() {
        // Arrange
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.send(b"CONNECT;abc123\n").await;

        // Act
        assert!(h.transport.notify("abc123", &[0x0a, 0x0b]));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Assert
        assert_eq!(h.sink.frames().last().unwrap(), "abc123;0a0b\n");
    }

    // ── Raw commands ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_raw_command_writes_decoded_bytes_once() {
        // Arrange
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.send(b"CONNECT;abc123\0\0\n").await;
        let replies_before = h.sink.frames().len();

        // Act
        h.send(b"abc123;0a0b\n").await;

        // Assert
        assert_eq!(h.transport.writes_to("abc123"), vec![vec![0x0a, 0x0b]]);
        assert_eq!(h.sink.frames().len(), replies_before, "raw commands get no reply");
    }

    #[tokio::test]
    async fn test_raw_command_to_unconnected_vehicle_is_dropped() {
        let h = Harness::new(vec![]);

        h.send(b"abc123;0a0b\n").await;

        assert!(h.transport.all_writes().is_empty());
        assert!(h.sink.frames().is_empty());
    }

    #[tokio::test]
    async fn test_raw_command_write_failure_is_dropped_and_next_write_works() {
        // Arrange
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.send(b"CONNECT;abc123\n").await;
        let replies_before = h.sink.frames().len();
        h.transport.set_fail_write(true);

        // Act
        h.send(b"abc123;0a0b\n").await;
        h.transport.set_fail_write(false);
        h.send(b"abc123;0c0d\n").await;

        // Assert: no reply either way, vehicle still connected
        assert_eq!(h.sink.frames().len(), replies_before);
        assert_eq!(h.transport.writes_to("abc123"), vec![vec![0x0c, 0x0d]]);
        assert!(h.state().connected.contains(&addr("abc123")));
    }

    #[tokio::test]
    async fn test_raw_command_with_bad_hex_is_dropped() {
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.send(b"CONNECT;abc123\n").await;

        h.send(b"abc123;0g\n").await;

        assert!(h.transport.writes_to("abc123").is_empty());
    }

    #[tokio::test]
    async fn test_unrecognised_frame_is_ignored() {
        let h = Harness::new(vec![]);

        h.send(b"HELLO\n").await;
        h.send(b"\0\0\0").await;

        assert!(h.sink.frames().is_empty());
    }

    // ── DISCONNECT ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_disconnect_connected_vehicle_clears_state() {
        // Arrange
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.send(b"CONNECT;abc123\n").await;

        // Act
        h.send(b"DISCONNECT;abc123\0\0\n").await;

        // Assert
        assert_eq!(h.sink.frames().last().unwrap(), "DISCONNECT;SUCCESS\n");
        assert!(!h.state().connected.contains(&addr("abc123")));
        assert!(!h.state().characteristics.contains(&addr("abc123")));
        assert_eq!(h.transport.disconnects(), vec!["abc123".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_vehicle_replies_error_without_transport_call() {
        let h = Harness::new(vec![]);

        h.send(b"DISCONNECT;abc123\n").await;

        assert_eq!(h.sink.frames(), vec!["DISCONNECT;ERROR\n"]);
        assert!(h.transport.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_close_failure_still_clears_state() {
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.send(b"CONNECT;abc123\n").await;
        h.transport.set_fail_disconnect(true);

        h.send(b"DISCONNECT;abc123\n").await;

        assert_eq!(h.sink.frames().last().unwrap(), "DISCONNECT;ERROR\n");
        assert!(h.state().connected.is_empty());
        assert!(h.state().characteristics.is_empty());
    }

    #[tokio::test]
    async fn test_raw_command_after_disconnect_is_dropped() {
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.send(b"CONNECT;abc123\n").await;
        h.send(b"DISCONNECT;abc123\n").await;

        h.send(b"abc123;0a0b\n").await;

        assert!(h.transport.writes_to("abc123").is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_every_vehicle() {
        // Arrange
        let h = Harness::new(vec![
            FakePeripheral::vehicle("aa01"),
            FakePeripheral::vehicle("bb02"),
            FakePeripheral::vehicle("cc03"),
        ]);
        h.send(b"SCAN\n").await;
        for vehicle in ["aa01", "bb02", "cc03"] {
            h.send(format!("CONNECT;{vehicle}\n").as_bytes()).await;
        }
        assert_eq!(h.state().connected.len(), 3);

        // Act
        h.dispatcher.disconnect_all().await;

        // Assert
        assert!(h.state().connected.is_empty());
        assert!(h.state().characteristics.is_empty());
        let mut closed = h.transport.disconnects();
        closed.sort();
        assert_eq!(closed, vec!["aa01", "bb02", "cc03"]);
    }

    // ── Per-address exclusion ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_concurrent_connects_open_one_link() {
        // Arrange: the first CONNECT stops half way, holding the address lock
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.transport.hold_discovery();
        let first = h.spawn_connect("abc123");
        wait_until(|| h.transport.discoveries_waiting() == 1).await;

        // Act
        let second = h.spawn_connect("abc123");
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.transport.release_discovery();
        let first = first.await.unwrap();
        let second = second.await.unwrap();

        // Assert
        assert!(first.is_ok());
        assert!(matches!(second, Err(DispatchError::AlreadyConnected(_))));
        assert_eq!(h.transport.connect_calls(), 1);
        assert_eq!(h.state().connected.len(), 1);
        assert_eq!(h.state().characteristics.len(), 1);
        assert!(h.transport.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_connect_in_progress() {
        // Arrange
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.transport.hold_discovery();
        let connect = h.spawn_connect("abc123");
        wait_until(|| h.transport.discoveries_waiting() == 1).await;

        // Act
        let dispatcher = Arc::clone(&h.dispatcher);
        let disconnect =
            tokio::spawn(async move { dispatcher.disconnect(Some("abc123")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.transport.release_discovery();
        let connected = connect.await.unwrap();
        let disconnected = disconnect.await.unwrap();

        // Assert: the DISCONNECT saw the finished connection and closed it
        assert!(connected.is_ok());
        assert!(disconnected.is_ok());
        assert!(h.state().connected.is_empty());
        assert!(h.state().characteristics.is_empty());
        assert_eq!(h.transport.disconnects(), vec!["abc123".to_string()]);
    }

    #[tokio::test]
    async fn test_teardown_refuses_connect_that_was_in_flight() {
        // Arrange: a CONNECT is half done when the session goes away
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.transport.hold_discovery();
        let connect = h.spawn_connect("abc123");
        wait_until(|| h.transport.discoveries_waiting() == 1).await;

        // Act
        let dispatcher = Arc::clone(&h.dispatcher);
        let teardown = tokio::spawn(async move { dispatcher.disconnect_all().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.transport.release_discovery();
        let connected = connect.await.unwrap();
        teardown.await.unwrap();

        // Assert: nothing left behind and the link was closed
        assert!(matches!(connected, Err(DispatchError::TornDown(_))));
        assert!(h.state().connected.is_empty());
        assert!(h.state().characteristics.is_empty());
        assert!(!h.transport.has_subscriber("abc123"));
        assert_eq!(h.transport.disconnects(), vec!["abc123".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_after_teardown_succeeds() {
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        h.dispatcher.disconnect_all().await;

        h.send(b"CONNECT;abc123\n").await;

        assert_eq!(h.sink.frames().last().unwrap(), "CONNECT;SUCCESS\n");
        assert!(h.state().connected.contains(&addr("abc123")));
    }

    #[tokio::test]
    async fn test_frame_read_before_teardown_cannot_connect() {
        // Arrange
        let h = Harness::new(vec![FakePeripheral::vehicle("abc123")]);
        h.send(b"SCAN\n").await;
        let read_at = h.state().teardown_epoch();
        h.dispatcher.disconnect_all().await;

        // Act
        let sink = Arc::clone(&h.sink) as Arc<dyn FrameSink>;
        h.dispatcher
            .dispatch_since(b"CONNECT;abc123\n", sink, read_at)
            .await;

        // Assert
        assert_eq!(h.sink.frames().last().unwrap(), "CONNECT;ERROR\n");
        assert!(h.state().connected.is_empty());
        assert_eq!(h.transport.disconnects(), vec!["abc123".to_string()]);
    }
}
