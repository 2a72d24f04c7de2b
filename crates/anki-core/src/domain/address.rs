//! Canonical device addresses.
//!
//! Addresses reach the bridge from two directions with different formatting:
//!
//! - The BLE stack reports them as `AA:BB:CC:DD:EE:FF` (Linux/Windows) or as
//!   a dashed UUID (macOS).
//! - The SDK client sends back whatever the bridge printed in its `SCAN`
//!   frames, possibly padded with NUL bytes from a fixed-size buffer.
//!
//! Every registry key is therefore a [`DeviceAddress`], which can only be
//! built through [`DeviceAddress::normalize`].  Discovery and lookup share the
//! same function, so the two sides can never disagree on the key.

use std::fmt;

use thiserror::Error;

/// Errors produced when a raw address string cannot be normalized.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// Nothing was left after stripping separators and padding.
    #[error("device address is empty")]
    Empty,

    /// A character other than a hex digit or a separator was found.
    #[error("device address {raw:?} contains invalid character {found:?}")]
    InvalidCharacter { raw: String, found: char },
}

/// A device address in canonical form: lowercase hex digits, no separators.
///
/// # Example
///
/// ```rust
/// use anki_core::DeviceAddress;
///
/// let addr = DeviceAddress::normalize("E4:1F:7C:0A:3B:9D").unwrap();
/// assert_eq!(addr.as_str(), "e41f7c0a3b9d");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Normalizes a raw address into its canonical form.
    ///
    /// Strips `:` and `-` separators, surrounding whitespace, carriage returns
    /// and NUL padding, then lowercases the remaining hex digits.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::Empty`] if nothing remains after stripping, or
    /// [`AddressError::InvalidCharacter`] for any non-hex character.
    pub fn normalize(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        let mut canonical = String::with_capacity(trimmed.len());
        for c in trimmed.chars() {
            match c {
                ':' | '-' => continue,
                c if c.is_ascii_hexdigit() => canonical.push(c.to_ascii_lowercase()),
                other => {
                    return Err(AddressError::InvalidCharacter {
                        raw: raw.to_string(),
                        found: other,
                    })
                }
            }
        }

        if canonical.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Self(canonical))
    }

    /// Returns the canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
