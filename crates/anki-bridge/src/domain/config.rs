//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! `main.rs` builds it from the config file plus CLI overrides; tests build it
//! directly with short timeouts.
//!
//! No global state and no environment reads happen here.  The infrastructure
//! layer populates the struct, and it is then shared as an `Arc` by every
//! session.

use std::net::SocketAddr;
use std::time::Duration;

/// Default TCP port the SDK connects to.
pub const DEFAULT_PORT: u16 = 5000;

/// All runtime configuration for the bridge.
///
/// # Example
///
/// ```rust
/// use anki_bridge::domain::BridgeConfig;
///
/// let cfg = BridgeConfig::default();
/// assert_eq!(cfg.listen_addr.port(), 5000);
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the TCP listener binds to.
    pub listen_addr: SocketAddr,

    /// How long a `SCAN` collects advertisements before reporting.
    pub scan_timeout: Duration,

    /// Pause between consecutive `SCAN;<device>` lines.
    ///
    /// The SDK reads with a small fixed buffer; without a pause several lines
    /// can land in one read and the SDK drops all but the first.
    pub scan_report_interval: Duration,

    /// Upper bound on a single frame write to the TCP peer.
    ///
    /// A relay whose write exceeds this drops the frame instead of stalling.
    pub write_timeout: Duration,

    /// Notifications buffered per device before new ones are dropped.
    pub relay_queue_depth: usize,
}

impl Default for BridgeConfig {
    /// | Field                 | Default          |
    /// |-----------------------|------------------|
    /// | listen_addr           | `0.0.0.0:5000`   |
    /// | scan_timeout          | 5 seconds        |
    /// | scan_report_interval  | 500 milliseconds |
    /// | write_timeout         | 2 seconds        |
    /// | relay_queue_depth     | 64               |
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            scan_timeout: Duration::from_secs(5),
            scan_report_interval: Duration::from_millis(500),
            write_timeout: Duration::from_secs(2),
            relay_queue_depth: 64,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listen_port_is_5000() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.listen_addr.port(), 5000);
        assert!(cfg.listen_addr.ip().is_unspecified());
    }

    #[test]
    fn test_default_scan_timing_matches_sdk_expectations() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.scan_timeout, Duration::from_secs(5));
        assert_eq!(cfg.scan_report_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_default_relay_bounds() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.write_timeout, Duration::from_secs(2));
        assert_eq!(cfg.relay_queue_depth, 64);
    }
}
