//! The SDK-facing text protocol: inbound commands and outbound responses.

pub mod command;
pub mod response;

use thiserror::Error;

pub use command::{split_frames, Command};
pub use response::{Response, SCAN_COMPLETED};

/// Errors raised while interpreting a frame's payload.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The command payload is not valid hex.
    #[error("invalid hex payload {payload:?}: {source}")]
    InvalidHex {
        payload: String,
        #[source]
        source: hex::FromHexError,
    },
}

/// Decodes the hex payload of a raw command into vehicle bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidHex`] for odd-length input or non-hex
/// characters.
pub fn decode_payload(payload_hex: &str) -> Result<Vec<u8>, ProtocolError> {
    hex::decode(payload_hex).map_err(|source| ProtocolError::InvalidHex {
        payload: payload_hex.to_string(),
        source,
    })
}
