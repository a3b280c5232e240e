//! Transport error types

use thiserror::Error;

/// Errors that can occur while talking to the Bluefruit adapter.
///
/// `Port` is fatal to the adapter session: the supervisor drops the adapter
/// and re-discovers the serial device. Everything else fails the specific
/// pending operation and the session continues.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    // Serial port errors (fatal to the session)
    #[error("Serial port error: {0}")]
    Port(String),

    // Adapter protocol mismatches (unmatched events, command too long)
    #[error("Adapter error: {0}")]
    Adapter(String),

    // Per-connection failures (conn_fail, disconn, read_fail, write_fail)
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Adapter stopped")]
    Stopped,
}

impl TransportError {
    /// True for errors that end the adapter session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Port(_) | TransportError::Stopped)
    }
}

impl From<tokio_serial::Error> for TransportError {
    fn from(e: tokio_serial::Error) -> Self {
        TransportError::Port(e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Port(e.to_string())
    }
}
