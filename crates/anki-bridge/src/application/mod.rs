//! Application layer for anki-bridge.
//!
//! Implements the protocol state machine on top of the transport capability
//! traits.  Nothing in here knows about sockets or a concrete Bluetooth stack:
//! outbound frames go through [`FrameSink`] and radio access through
//! [`Transport`].

pub mod discovery;
pub mod dispatcher;
pub mod relay;
pub mod state;
pub mod transport;

pub use discovery::{DiscoveryEngine, DiscoveryError};
pub use dispatcher::{CommandDispatcher, DispatchError};
pub use relay::{FrameSink, NotificationRelay, SinkError};
pub use state::{BridgeState, ConnectedDevice};
pub use transport::{
    Advertisement, AdvertisementCallback, GattCharacteristic, NotificationCallback,
    PeripheralLink, Transport, TransportError,
};
