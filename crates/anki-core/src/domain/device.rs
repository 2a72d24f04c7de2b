//! Discovered vehicle records.

use crate::domain::address::DeviceAddress;

/// Substring an advertised local name must contain for the peripheral to be
/// treated as an Anki Drive vehicle.
pub const DRIVE_NAME_MARKER: &str = "Drive";

/// Prefix placed in front of the hex-encoded manufacturer data.
///
/// `0xBEEF` is the Anki company identifier; the SDK expects it at the start of
/// the manufacturer-data field it parses out of `SCAN` frames.
pub const MANUFACTURER_DATA_PREFIX: &str = "beef";

/// Display name reported for every vehicle, already hex-encoded.
///
/// Decodes to `"\x10\x60\x30\x01    Drive"`: the state/version bytes followed by
/// the padded name the SDK uses to recognise a vehicle.  The name the vehicle
/// actually advertises is replaced by this constant on purpose because several
/// firmware versions advertise an empty or truncated name.
pub const DISPLAY_NAME: &str = "10603001202020204472697665";

/// A vehicle observed during a scan.
///
/// `H` is the opaque transport handle needed to open a connection later; the
/// core never looks inside it.  Records are immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord<H> {
    /// Canonical address, also used as the registry key.
    pub address: DeviceAddress,
    /// Hex manufacturer data including [`MANUFACTURER_DATA_PREFIX`], or empty
    /// when the advertisement carried none.
    pub manufacturer_data: String,
    /// Always [`DISPLAY_NAME`].
    pub display_name: String,
    /// Transport handle used to initiate a connection.
    pub handle: H,
}

impl<H> DeviceRecord<H> {
    /// Synthesizes a record from the raw advertisement fields.
    pub fn from_advertisement(
        address: DeviceAddress,
        manufacturer_data: Option<&[u8]>,
        handle: H,
    ) -> Self {
        Self {
            address,
            manufacturer_data: encode_manufacturer_data(manufacturer_data),
            display_name: DISPLAY_NAME.to_string(),
            handle,
        }
    }
}

/// Returns `true` if an advertised local name identifies an Anki vehicle.
pub fn is_drive_vehicle(local_name: Option<&str>) -> bool {
    local_name.is_some_and(|name| name.contains(DRIVE_NAME_MARKER))
}

/// Hex-encodes manufacturer bytes behind the fixed `beef` prefix.
///
/// ```rust
/// use anki_core::domain::device::encode_manufacturer_data;
///
/// assert_eq!(encode_manufacturer_data(Some(&[0x01, 0x02])), "beef0102");
/// assert_eq!(encode_manufacturer_data(None), "");
/// ```
pub fn encode_manufacturer_data(data: Option<&[u8]>) -> String {
    match data {
        Some(bytes) => format!("{MANUFACTURER_DATA_PREFIX}{}", hex::encode(bytes)),
        None => String::new(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
