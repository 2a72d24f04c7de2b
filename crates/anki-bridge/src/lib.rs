//! anki-bridge library crate.
//!
//! This crate exposes Anki Drive vehicles, which only speak Bluetooth LE, to
//! the Anki Drive SDK over a line-oriented TCP protocol.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Anki Drive SDK  (SCAN / CONNECT / DISCONNECT / <addr>;<hex> over TCP)
//!         ↕
//! [anki-bridge]
//!   ├── domain/           BridgeConfig
//!   ├── application/      Transport traits, shared state, discovery,
//!   │                     command dispatcher, notification relay
//!   └── infrastructure/
//!         ├── tcp_server/     accept loop + per-session read loop
//!         ├── session_writer/ serialized, time-bounded frame writes
//!         ├── ble/            btleplug transport
//!         └── config_file/    optional TOML configuration
//!         ↕
//! Anki Drive vehicles  (GATT write / notify)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O.
//! - `application` depends on `domain` and `anki-core`, and reaches the radio
//!   and the socket only through the `Transport` and `FrameSink` traits.
//! - `infrastructure` implements those traits with `tokio` and `btleplug`.

/// Domain layer: pure configuration types (no I/O).
pub mod domain;

/// Application layer: the protocol state machine.
pub mod application;

/// Infrastructure layer: TCP server, Bluetooth transport, config file.
pub mod infrastructure;
