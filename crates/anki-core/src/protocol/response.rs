//! Outbound frames sent from the bridge to the SDK.

use std::fmt;

use crate::domain::address::DeviceAddress;

/// Terminal line of a scan report.
pub const SCAN_COMPLETED: &str = "SCAN;COMPLETED\n";

/// One outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// One discovered vehicle.
    ScanResult {
        address: DeviceAddress,
        manufacturer_data: String,
        display_name: String,
    },
    ScanCompleted,
    ConnectSuccess,
    ConnectError,
    DisconnectSuccess,
    DisconnectError,
    /// Unsolicited data pushed by a vehicle.
    Notification {
        address: DeviceAddress,
        payload: Vec<u8>,
    },
}

impl Response {
    /// Encodes the frame including its trailing newline.
    ///
    /// ```rust
    /// use anki_core::protocol::Response;
    ///
    /// assert_eq!(Response::ConnectSuccess.encode(), "CONNECT;SUCCESS\n");
    /// ```
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScanResult {
                address,
                manufacturer_data,
                display_name,
            } => writeln!(f, "SCAN;{address};{manufacturer_data};{display_name}"),
            Self::ScanCompleted => f.write_str(SCAN_COMPLETED),
            Self::ConnectSuccess => f.write_str("CONNECT;SUCCESS\n"),
            Self::ConnectError => f.write_str("CONNECT;ERROR\n"),
            Self::DisconnectSuccess => f.write_str("DISCONNECT;SUCCESS\n"),
            Self::DisconnectError => f.write_str("DISCONNECT;ERROR\n"),
            Self::Notification { address, payload } => {
                writeln!(f, "{address};{}", hex::encode(payload))
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
