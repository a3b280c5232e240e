//! Badge protocol error types

use nametag_transport::TransportError;
use thiserror::Error;

/// Errors from the badge GATT protocol.
///
/// Transport failures pass through unchanged so callers can tell an
/// expected connection loss from a protocol violation.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Timed out waiting for chunk {chunk} acknowledgement")]
    AckTimeout { chunk: u16 },

    #[error("Bad acknowledgement for chunk {chunk}: expected {expected}, got {got}")]
    BadAck {
        chunk: u16,
        expected: String,
        got: String,
    },

    #[error("Bad frame: {0}")]
    BadFrame(String),

    #[error("Stash too long ({0} > 18 bytes)")]
    StashTooLong(usize),

    #[error("Stash read-back mismatch: wrote {wrote}, read {read}")]
    StashReadback { wrote: String, read: String },

    #[error("Glyph size ({width}, {height}) != ([1-48], 12)")]
    BadGlyph { width: usize, height: usize },

    #[error("Animation frame size ({width}, {height}) != (48, 12)")]
    BadAnimationFrame { width: usize, height: usize },

    #[error("Too many glyphs ({0} > 80)")]
    TooManyGlyphs(usize),

    #[error("Too many animation frames ({0} > 255)")]
    TooManyFrames(usize),

    #[error("Nothing to display")]
    EmptyDisplay,
}

/// Render bytes as lowercase hex for error messages and logs.
pub(crate) fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
