//! # anki-core
//!
//! Shared library for the Anki Drive bridge containing device identity rules,
//! the concurrent device registry and the SDK text protocol.
//!
//! It has no dependency on sockets, async runtimes or a Bluetooth stack, so
//! every rule in here is unit-testable in isolation.
//!
//! - **`domain`** – canonical [`DeviceAddress`]es, [`DeviceRecord`]s built
//!   from advertisements, GATT UUIDs with role mapping, and the sharded
//!   [`Registry`] the bridge keeps its device state in.
//!
//! - **`protocol`** – the `;`-separated text frames exchanged with the SDK:
//!   [`Command::parse`] for inbound lines and [`Response`] for outbound ones.

pub mod domain;
pub mod protocol;

pub use domain::address::{AddressError, DeviceAddress};
pub use domain::device::DeviceRecord;
pub use domain::gatt::{CharacteristicPair, CharacteristicRole, MissingCharacteristic};
pub use domain::registry::Registry;
pub use protocol::{Command, ProtocolError, Response};
