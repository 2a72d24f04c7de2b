//! Concurrency-safe registries keyed by [`DeviceAddress`].
//!
//! The bridge keeps three of these (discovered devices, connected devices and
//! characteristic handles).  They are touched from the TCP dispatch tasks, the
//! scan callback and the notification relays at the same time, so every
//! operation here is atomic per key and never holds a lock across an `.await`
//! or a call back into user code.
//!
//! # Why `DashMap`?
//!
//! `DashMap` shards the map into independently locked buckets.  A writer only
//! blocks readers of the same shard, and only for the duration of the insert
//! or remove itself.  Values are cloned out on read so no shard guard ever
//! escapes this module.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::domain::address::DeviceAddress;

/// An address-keyed map that is safe under unbounded concurrent callers.
#[derive(Debug)]
pub struct Registry<V> {
    entries: DashMap<DeviceAddress, V>,
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V: Clone> Registry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from `(address, value)` pairs; later duplicates win.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (DeviceAddress, V)>,
    {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Inserts or replaces the value for `address`.
    pub fn set(&self, address: DeviceAddress, value: V) {
        self.entries.insert(address, value);
    }

    /// Inserts `value` only if `address` is not present yet.
    ///
    /// Returns `true` if the value was inserted.  The check and the insert
    /// happen under one shard lock, so two racing callers cannot both win.
    pub fn insert_if_absent(&self, address: DeviceAddress, value: V) -> bool {
        match self.entries.entry(address) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Returns the value for `address`, or inserts the one built by `make`.
    pub fn get_or_insert_with<F>(&self, address: DeviceAddress, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.entries.entry(address).or_insert_with(make).value().clone()
    }

    /// Returns a copy of the value for `address`.
    pub fn get(&self, address: &DeviceAddress) -> Option<V> {
        self.entries.get(address).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.entries.contains_key(address)
    }

    /// Removes and returns the value for `address`.
    pub fn remove(&self, address: &DeviceAddress) -> Option<V> {
        self.entries.remove(address).map(|(_, value)| value)
    }

    /// Point-in-time snapshot of every entry, in no particular order.
    pub fn items(&self) -> Vec<(DeviceAddress, V)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Snapshot of every entry sorted by address.
    pub fn sorted_items(&self) -> Vec<(DeviceAddress, V)> {
        let mut items = self.items();
        items.sort_by(|(a, _), (b, _)| a.cmp(b));
        items
    }

    /// Removes every entry and returns what was removed.
    ///
    /// Each key is removed atomically; an entry inserted concurrently after
    /// its shard was visited survives the drain.
    pub fn drain(&self) -> Vec<(DeviceAddress, V)> {
        let keys: Vec<DeviceAddress> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
