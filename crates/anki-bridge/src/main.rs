//! Anki Drive bridge entry point.
//!
//! This binary accepts TCP connections from the Anki Drive SDK and translates
//! its text commands into Bluetooth LE operations on Anki Drive vehicles.
//!
//! # Why a separate bridge process?
//!
//! The SDK runs on the JVM, which has no portable Bluetooth LE API.  The SDK
//! therefore talks plain TCP to this process, which owns the radio:
//!
//! - `SCAN` discovers vehicles for a few seconds and reports each one.
//! - `CONNECT;<addr>` / `DISCONNECT;<addr>` open and close a vehicle link.
//! - `<addr>;<hex>` writes a raw vehicle command.
//! - Vehicle notifications come back as `<addr>;<hex>`.
//!
//! # Usage
//!
//! ```text
//! anki-bridge [OPTIONS]
//!
//! Options:
//!   --config <PATH>            TOML config file [default: ./anki-bridge.toml if present]
//!   --host <HOST>              Listen address [default: 0.0.0.0]
//!   --port <PORT>              Listen port [default: 5000]
//!   --scan-timeout-ms <MS>     SCAN duration in milliseconds [default: 5000]
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                       | Description                    |
//! |--------------------------------|--------------------------------|
//! | `ANKI_BRIDGE_CONFIG`           | Config file path               |
//! | `ANKI_BRIDGE_HOST`             | Listen address                 |
//! | `ANKI_BRIDGE_PORT`             | Listen port                    |
//! | `ANKI_BRIDGE_SCAN_TIMEOUT_MS`  | SCAN duration in milliseconds  |
//! | `RUST_LOG`                     | `tracing` filter directive     |
//!
//! Precedence is CLI flag, then environment variable, then config file, then
//! built-in default.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use anki_bridge::domain::BridgeConfig;
use anki_bridge::infrastructure::{load_config, run_server, BtleplugTransport, FileConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Anki Drive TCP-to-Bluetooth-LE bridge.
///
/// Every option is optional; anything not given here falls back to the
/// config file and then to the built-in defaults.
#[derive(Debug, Parser)]
#[command(
    name = "anki-bridge",
    about = "TCP-to-Bluetooth-LE bridge for the Anki Drive SDK",
    version
)]
struct Cli {
    /// Path of the TOML config file.
    ///
    /// When omitted, `anki-bridge.toml` in the working directory is used if
    /// it exists.
    #[arg(long, env = "ANKI_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// IP address or host name to listen on.
    ///
    /// Use `127.0.0.1` when the SDK runs on the same machine.
    #[arg(long, env = "ANKI_BRIDGE_HOST")]
    host: Option<String>,

    /// TCP port to listen on.
    #[arg(long, env = "ANKI_BRIDGE_PORT")]
    port: Option<u16>,

    /// How long a SCAN listens for advertisements, in milliseconds.
    #[arg(long, env = "ANKI_BRIDGE_SCAN_TIMEOUT_MS")]
    scan_timeout_ms: Option<u64>,
}

impl Cli {
    /// Applies the command-line overrides on top of the file settings.
    fn apply(&self, mut file: FileConfig) -> FileConfig {
        if let Some(host) = &self.host {
            file.server.host = host.clone();
        }
        if let Some(port) = self.port {
            file.server.port = port;
        }
        if let Some(timeout_ms) = self.scan_timeout_ms {
            file.scan.timeout_ms = timeout_ms;
        }
        file
    }

    /// Converts the parsed CLI arguments plus file settings into a
    /// [`BridgeConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting host/port pair is not a valid socket
    /// address or a relay setting is out of range.
    fn into_bridge_config(self, file: FileConfig) -> anyhow::Result<BridgeConfig> {
        self.apply(file)
            .to_bridge_config()
            .context("invalid bridge configuration")
    }
}

/// `RUST_LOG` wins; otherwise the file's `log_level`; otherwise `info`.
fn log_filter(file_level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(file_level.unwrap_or("info")))
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. CLI arguments are parsed with `clap`.
/// 2. The config file is loaded (a missing explicit file is fatal).
/// 3. `tracing_subscriber` is initialised.
/// 4. The first Bluetooth adapter is opened (fatal if there is none).
/// 5. A Ctrl+C handler clears the shared `running` flag.
/// 6. [`run_server`] serves SDK sessions until the flag is cleared, then
///    disconnects every vehicle.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file = load_config(cli.config.as_deref()).context("failed to load configuration")?;

    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(file.log_level.as_deref()))
        .init();

    let config = cli.into_bridge_config(file)?;

    info!(
        "Anki Drive bridge starting: listen={}, scan={:?}",
        config.listen_addr, config.scan_timeout
    );

    let transport = BtleplugTransport::first_adapter()
        .await
        .context("failed to open Bluetooth adapter")?;

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    // ── Main server loop ───────────────────────────────────────────────────────
    run_server(config, Arc::new(transport), running).await?;

    info!("Anki Drive bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
