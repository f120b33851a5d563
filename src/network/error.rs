//! Common error types for network operations

use core::fmt;

/// A common error type for network operations.
///
/// Transports report these through their `Read`/`Write` implementations. The
/// MQTT client never inspects the variant; any transport error is treated as a
/// failed send and recovered through the connection state machine.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// An operation was attempted on a connection that is not open.
    NotOpen,
    /// An error occurred during a write operation.
    WriteError,
    /// A connection attempt was refused or could not be started.
    ConnectionRefused,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::NotOpen => "connection not open",
            Error::WriteError => "write failed",
            Error::ConnectionRefused => "connection refused",
        };
        f.write_str(text)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::NotOpen => defmt::write!(f, "NotOpen"),
            Error::WriteError => defmt::write!(f, "WriteError"),
            Error::ConnectionRefused => defmt::write!(f, "ConnectionRefused"),
        }
    }
}
