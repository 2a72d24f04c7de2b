//! Inbound frame parsing.
//!
//! The SDK speaks a line-oriented text protocol.  A frame is one line of UTF-8
//! text whose fields are separated by `;`.  Dispatch is deliberately loose and
//! follows the SDK's expectations rather than a strict grammar:
//!
//! | Priority | Rule                                      | Result                    |
//! |----------|-------------------------------------------|---------------------------|
//! | 1        | frame contains `SCAN` anywhere            | [`Command::Scan`]         |
//! | 2        | frame contains `DISCONNECT` anywhere      | [`Command::Disconnect`]   |
//! | 3        | field 0 contains `CONNECT`                | [`Command::Connect`]      |
//! | 4        | exactly two fields                        | [`Command::Raw`]          |
//! | –        | anything else                             | [`Command::Ignored`]      |
//!
//! Frames read from a fixed-size buffer may carry NUL padding; it is stripped
//! from every field together with `\r` so CRLF clients work too.

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a discovery scan.
    Scan,
    /// Connect to a previously discovered vehicle.  `None` when the frame had
    /// no address field.
    Connect { address: Option<String> },
    /// Disconnect a connected vehicle.
    Disconnect { address: Option<String> },
    /// Forward a hex payload to the vehicle at `address`.
    Raw { address: String, payload_hex: String },
    /// Nothing to do (empty line, unknown single-field frame, ...).
    Ignored,
}

impl Command {
    /// Parses one frame.  Never fails: unrecognised input maps to
    /// [`Command::Ignored`].
    ///
    /// ```rust
    /// use anki_core::protocol::Command;
    ///
    /// assert_eq!(Command::parse(b"SCAN\n"), Command::Scan);
    /// assert_eq!(
    ///     Command::parse(b"CONNECT;abc123\0\0\n"),
    ///     Command::Connect { address: Some("abc123".to_string()) }
    /// );
    /// ```
    pub fn parse(frame: &[u8]) -> Self {
        let text = String::from_utf8_lossy(frame);
        let text = text.replace('\n', "");

        let fields: Vec<&str> = text.split(';').map(clean_field).collect();
        let payload = fields.get(1).filter(|f| !f.is_empty()).map(|f| f.to_string());

        if text.contains("SCAN") {
            return Self::Scan;
        }
        if text.contains("DISCONNECT") {
            return Self::Disconnect { address: payload };
        }
        if fields[0].contains("CONNECT") {
            return Self::Connect { address: payload };
        }
        if fields.len() == 2 {
            return Self::Raw {
                address: fields[0].to_string(),
                payload_hex: fields[1].to_string(),
            };
        }
        Self::Ignored
    }

    /// Short variant name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan => "SCAN",
            Self::Connect { .. } => "CONNECT",
            Self::Disconnect { .. } => "DISCONNECT",
            Self::Raw { .. } => "RAW",
            Self::Ignored => "IGNORED",
        }
    }
}

/// Splits one read into frames on `\n`.
///
/// Every non-blank segment is a frame, including a trailing one without a
/// newline: a client that writes one command per packet and omits the
/// terminator is still served.
pub fn split_frames(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|b| *b == b'\n')
        .filter(|segment| segment.iter().any(|b| !matches!(b, b'\0' | b'\r' | b' ')))
}

fn clean_field(field: &str) -> &str {
    field.trim_matches(|c| c == '\0' || c == '\r')
}

// ── Tests ─────────────────────────────────────────────────────────────────────
