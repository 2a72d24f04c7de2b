//! TOML configuration file for the bridge.
//!
//! The file is optional.  Every key has a default, so an empty file, a file
//! with only `[server]`, or no file at all are all valid:
//!
//! ```toml
//! log_level = "debug"
//!
//! [server]
//! host = "0.0.0.0"
//! port = 5000
//!
//! [scan]
//! timeout_ms = 5000
//! report_interval_ms = 500
//!
//! [relay]
//! write_timeout_ms = 2000
//! queue_depth = 64
//! ```
//!
//! `host` may be an IP address or a host name such as `localhost`; names are
//! resolved once at startup and the first address returned is used.
//!
//! Command-line flags override whatever the file says; see `main.rs`.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::config::{BridgeConfig, DEFAULT_PORT};

/// Looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "anki-bridge.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// `host` is neither an IP address nor a resolvable host name.
    #[error("invalid listen address '{host}:{port}'")]
    InvalidListenAddress { host: String, port: u16 },

    /// A relay queue of depth zero could never deliver anything.
    #[error("relay.queue_depth must be at least 1")]
    ZeroQueueDepth,
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level file layout.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// `tracing` filter directive used when `RUST_LOG` is not set.
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// TCP listener settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Discovery timing.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScanSection {
    #[serde(default = "default_scan_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

/// Notification relay bounds.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RelaySection {
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_scan_timeout_ms() -> u64 {
    5_000
}
fn default_report_interval_ms() -> u64 {
    500
}
fn default_write_timeout_ms() -> u64 {
    2_000
}
fn default_queue_depth() -> usize {
    64
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_scan_timeout_ms(),
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout_ms(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl FileConfig {
    /// Converts the file settings into a [`BridgeConfig`].
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidListenAddress`] if `host` does not resolve,
    /// [`ConfigError::ZeroQueueDepth`] for `queue_depth = 0`.
    pub fn to_bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        let listen_addr = parse_listen_addr(&self.server.host, self.server.port)?;
        if self.relay.queue_depth == 0 {
            return Err(ConfigError::ZeroQueueDepth);
        }

        Ok(BridgeConfig {
            listen_addr,
            scan_timeout: Duration::from_millis(self.scan.timeout_ms),
            scan_report_interval: Duration::from_millis(self.scan.report_interval_ms),
            write_timeout: Duration::from_millis(self.relay.write_timeout_ms),
            relay_queue_depth: self.relay.queue_depth,
        })
    }
}

/// Joins a host and port into a socket address, resolving host names.
///
/// # Errors
///
/// [`ConfigError::InvalidListenAddress`] if `host` is not an IP address and
/// name resolution yields nothing.
pub fn parse_listen_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut resolved| resolved.next())
        .ok_or_else(|| ConfigError::InvalidListenAddress {
            host: host.to_string(),
            port,
        })
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads the configuration file.
///
/// With `Some(path)` the file must exist.  With `None`,
/// [`DEFAULT_CONFIG_PATH`] is tried and defaults are used if it is absent.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors (including a missing explicit
/// file) and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(explicit: Option<&Path>) -> Result<FileConfig, ConfigError> {
    let path = explicit.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
            Ok(FileConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parses configuration from TOML text.
///
/// # Errors
///
/// [`ConfigError::Parse`] if the text is not valid TOML for [`FileConfig`].
pub fn parse_config(content: &str) -> Result<FileConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
