//! Infrastructure layer for anki-bridge.
//!
//! The infrastructure layer handles all I/O: the TCP listener the SDK
//! connects to, the Bluetooth stack, and the configuration file.
//!
//! # Responsibilities
//!
//! - Binding the TCP listener and spawning per-session read loops
//! - Serializing outbound frames onto each session's socket
//! - Adapting `btleplug` to the application's transport traits
//! - Loading the optional TOML configuration file
//!
//! # What does NOT belong here?
//!
//! - Command parsing and the protocol state machine (application layer)
//! - Address and frame rules (`anki-core`)

pub mod ble;
pub mod config_file;
pub mod fake_transport;
pub mod session_writer;
pub mod tcp_server;

// Re-export the primary entry points so `main.rs` can call them concisely.
pub use ble::BtleplugTransport;
pub use config_file::{load_config, ConfigError, FileConfig};
pub use tcp_server::{run_server, serve};
