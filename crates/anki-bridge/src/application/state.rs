//! Process-wide device state shared by every session.
//!
//! [`BridgeState`] is constructed once in `run_server` (or by a test) and
//! handed to each component as an `Arc`.  It owns the three registries:
//!
//! | Registry          | Key     | Value                                  |
//! |-------------------|---------|----------------------------------------|
//! | `discovered`      | address | [`DeviceRecord`] from the latest scan  |
//! | `characteristics` | address | write + notify handles                 |
//! | `connected`       | address | live link + relay task                 |
//!
//! An address present in `connected` always has a `characteristics` entry:
//! CONNECT inserts characteristics first and every removal path removes
//! `connected` first.
//!
//! # Teardown epochs
//!
//! A session teardown bumps the teardown epoch before it walks the address
//! locks.  CONNECT reads the epoch before taking its lock and re-checks it,
//! under the lock, right before inserting.  A CONNECT that was in flight when
//! a teardown began therefore never registers a device the teardown has
//! already passed over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use anki_core::{CharacteristicPair, DeviceAddress, DeviceRecord, Registry};

use super::transport::{CharacteristicOf, Transport};

/// The discovered-set for transport `T`.
pub type DiscoveredRegistry<T> = Registry<DeviceRecord<<T as Transport>::Peripheral>>;

/// A vehicle with an open link.
#[derive(Debug, Clone)]
pub struct ConnectedDevice<L> {
    pub link: L,
    /// Handle of the notification relay worker.
    pub relay: AbortHandle,
}

/// Registries plus the per-address exclusion locks.
pub struct BridgeState<T: Transport> {
    /// Replaced wholesale by each scan; readers clone the `Arc`.
    discovered: RwLock<Arc<DiscoveredRegistry<T>>>,
    pub characteristics: Registry<CharacteristicPair<CharacteristicOf<T>>>,
    pub connected: Registry<ConnectedDevice<T::Link>>,
    locks: Registry<Arc<Mutex<()>>>,
    teardown_epoch: AtomicU64,
}

impl<T: Transport> Default for BridgeState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> BridgeState<T> {
    pub fn new() -> Self {
        Self {
            discovered: RwLock::new(Arc::new(Registry::new())),
            characteristics: Registry::new(),
            connected: Registry::new(),
            locks: Registry::new(),
            teardown_epoch: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current discovered-set.
    pub fn discovered(&self) -> Arc<DiscoveredRegistry<T>> {
        let guard = match self.discovered.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }

    /// Replaces the discovered-set with the result of a new scan.
    pub fn replace_discovered(&self, registry: DiscoveredRegistry<T>) {
        let mut guard = match self.discovered.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(registry);
    }

    /// Looks up a discovered device.
    pub fn discovered_device(
        &self,
        address: &DeviceAddress,
    ) -> Option<DeviceRecord<T::Peripheral>> {
        self.discovered().get(address)
    }

    /// The lock serializing CONNECT and DISCONNECT for `address`.
    ///
    /// Locks are created on first use and never removed; there is one per
    /// address ever seen, which is bounded by the number of vehicles.
    pub fn address_lock(&self, address: &DeviceAddress) -> Arc<Mutex<()>> {
        self.locks
            .get_or_insert_with(address.clone(), || Arc::new(Mutex::new(())))
    }

    /// Every address that has ever had a lock, i.e. every address a CONNECT
    /// or DISCONNECT has touched.
    pub fn locked_addresses(&self) -> Vec<DeviceAddress> {
        self.locks
            .items()
            .into_iter()
            .map(|(address, _)| address)
            .collect()
    }

    /// Number of teardowns started so far.
    pub fn teardown_epoch(&self) -> u64 {
        self.teardown_epoch.load(Ordering::SeqCst)
    }

    /// Starts a teardown; CONNECTs that read an older epoch will not
    /// register their device.
    pub fn begin_teardown(&self) -> u64 {
        self.teardown_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Removes a device from both connection registries.
    ///
    /// Returns the connected entry, if there was one.  `connected` is removed
    /// before `characteristics`.
    pub fn forget_connection(
        &self,
        address: &DeviceAddress,
    ) -> Option<ConnectedDevice<T::Link>> {
        let entry = self.connected.remove(address);
        self.characteristics.remove(address);
        entry
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::fake_transport::FakeTransport;

    fn addr(raw: &str) -> DeviceAddress {
        DeviceAddress::normalize(raw).unwrap()
    }

    #[test]
    fn test_new_state_is_empty() {
        let state = BridgeState::<FakeTransport>::new();

        assert!(state.discovered().is_empty());
        assert!(state.connected.is_empty());
        assert!(state.characteristics.is_empty());
    }

    #[test]
    fn test_replace_discovered_swaps_whole_registry() {
        // Arrange
        let state = BridgeState::<FakeTransport>::new();
        let first = Registry::new();
        first.set(
            addr("aa01"),
            DeviceRecord::from_advertisement(addr("aa01"), None, "aa01".to_string()),
        );
        state.replace_discovered(first);

        // Act
        let second = Registry::new();
        second.set(
            addr("bb02"),
            DeviceRecord::from_advertisement(addr("bb02"), None, "bb02".to_string()),
        );
        state.replace_discovered(second);

        // Assert
        assert!(state.discovered_device(&addr("aa01")).is_none());
        assert!(state.discovered_device(&addr("bb02")).is_some());
    }

    #[test]
    fn test_snapshot_survives_replacement() {
        let state = BridgeState::<FakeTransport>::new();
        let first = Registry::new();
        first.set(
            addr("aa01"),
            DeviceRecord::from_advertisement(addr("aa01"), None, "aa01".to_string()),
        );
        state.replace_discovered(first);

        let snapshot = state.discovered();
        state.replace_discovered(Registry::new());

        assert_eq!(snapshot.len(), 1);
        assert!(state.discovered().is_empty());
    }

    #[test]
    fn test_address_lock_is_shared_per_address() {
        let state = BridgeState::<FakeTransport>::new();

        let a1 = state.address_lock(&addr("aa01"));
        let a2 = state.address_lock(&addr("AA:01"));
        let b = state.address_lock(&addr("bb02"));

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[test]
    fn test_locked_addresses_lists_every_lock_once() {
        let state = BridgeState::<FakeTransport>::new();
        state.address_lock(&addr("aa01"));
        state.address_lock(&addr("AA:01"));
        state.address_lock(&addr("bb02"));

        let mut addresses = state.locked_addresses();
        addresses.sort();

        assert_eq!(addresses, vec![addr("aa01"), addr("bb02")]);
    }

    #[test]
    fn test_begin_teardown_advances_epoch() {
        let state = BridgeState::<FakeTransport>::new();
        let before = state.teardown_epoch();

        let started = state.begin_teardown();

        assert_eq!(started, before + 1);
        assert_eq!(state.teardown_epoch(), started);
    }
}
