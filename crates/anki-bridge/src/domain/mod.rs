//! Domain layer for anki-bridge.
//!
//! Pure types with no I/O.  Device identity, records and the wire protocol
//! live in `anki-core`; what remains here is bridge-specific configuration.

pub mod config;

pub use config::BridgeConfig;
