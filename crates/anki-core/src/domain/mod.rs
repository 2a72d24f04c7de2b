//! Domain layer: device identity, records, GATT roles and registries.
//!
//! Nothing in here performs I/O.  The transport handle carried by a
//! [`device::DeviceRecord`] is a type parameter so this crate never depends on
//! a BLE stack.

pub mod address;
pub mod device;
pub mod gatt;
pub mod registry;
