//! Error types for the MQTT client.

use core::fmt;

/// Errors returned to the application by the MQTT client.
///
/// Protocol-level problems with packets received from the broker are never
/// reported here; such packets are logged and dropped (see [`PacketError`]).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The outgoing queue is full; try again once earlier messages completed.
    QueueFull,
    /// The topic exceeds [`MAX_TOPIC_LEN`](super::MAX_TOPIC_LEN) bytes.
    TopicTooLong,
    /// The payload exceeds [`MAX_PAYLOAD_LEN`](super::MAX_PAYLOAD_LEN) bytes.
    PayloadTooLarge,
    /// The client identifier does not fit the client.
    InvalidClientId,
    /// The topic is empty, or a topic name contains wildcards.
    InvalidTopic,
    /// A reconnect was requested before any address was given.
    NoAddress,
    /// The transport refused to open a connection.
    Transport,
    /// The configuration document could not be parsed.
    Config,
    /// The task owning the client has stopped.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::QueueFull => "outgoing queue full",
            Error::TopicTooLong => "topic too long",
            Error::PayloadTooLarge => "payload too large",
            Error::InvalidClientId => "invalid client identifier",
            Error::InvalidTopic => "invalid topic",
            Error::NoAddress => "no broker address",
            Error::Transport => "transport error",
            Error::Config => "invalid configuration",
            Error::Closed => "client task stopped",
        };
        f.write_str(text)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::QueueFull => defmt::write!(f, "QueueFull"),
            Error::TopicTooLong => defmt::write!(f, "TopicTooLong"),
            Error::PayloadTooLarge => defmt::write!(f, "PayloadTooLarge"),
            Error::InvalidClientId => defmt::write!(f, "InvalidClientId"),
            Error::InvalidTopic => defmt::write!(f, "InvalidTopic"),
            Error::NoAddress => defmt::write!(f, "NoAddress"),
            Error::Transport => defmt::write!(f, "Transport"),
            Error::Config => defmt::write!(f, "Config"),
            Error::Closed => defmt::write!(f, "Closed"),
        }
    }
}

/// Reasons a packet is rejected by the codec.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PacketError {
    /// The fixed header type nibble is not a packet a client accepts.
    UnknownType,
    /// The packet was larger than the configured maximum and was drained.
    TooBig,
    /// The remaining length field is longer than four bytes or exceeds the maximum.
    MalformedLength,
    /// The buffer ends before the fields the packet type requires.
    TooShort,
    /// Remaining length and buffer contents do not add up.
    LengthMismatch,
    /// Fixed header flags violate the packet type's contract.
    InvalidFlags,
    /// A QoS field holds the reserved value 3.
    InvalidQoS,
    /// A string field is not valid UTF-8.
    InvalidUtf8,
    /// A field does not fit the fixed-capacity buffers.
    Capacity,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PacketError::UnknownType => "unknown packet type",
            PacketError::TooBig => "packet too big",
            PacketError::MalformedLength => "malformed remaining length",
            PacketError::TooShort => "packet too short",
            PacketError::LengthMismatch => "lengths do not add up",
            PacketError::InvalidFlags => "invalid fixed header flags",
            PacketError::InvalidQoS => "invalid QoS",
            PacketError::InvalidUtf8 => "invalid UTF-8",
            PacketError::Capacity => "field exceeds buffer capacity",
        };
        f.write_str(text)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PacketError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            PacketError::UnknownType => defmt::write!(f, "UnknownType"),
            PacketError::TooBig => defmt::write!(f, "TooBig"),
            PacketError::MalformedLength => defmt::write!(f, "MalformedLength"),
            PacketError::TooShort => defmt::write!(f, "TooShort"),
            PacketError::LengthMismatch => defmt::write!(f, "LengthMismatch"),
            PacketError::InvalidFlags => defmt::write!(f, "InvalidFlags"),
            PacketError::InvalidQoS => defmt::write!(f, "InvalidQoS"),
            PacketError::InvalidUtf8 => defmt::write!(f, "InvalidUtf8"),
            PacketError::Capacity => defmt::write!(f, "Capacity"),
        }
    }
}
