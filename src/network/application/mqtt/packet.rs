//! Wire-level representation of MQTT control packets.
//!
//! Every packet on the wire is laid out as
//!
//! ```text
//! ┌──────────────┬──────────────────────┬─────────────────┬─────────┐
//! │ type | flags │ remaining length     │ variable header │ payload │
//! │ 1 byte       │ 1-4 bytes, 7 bits ea │                 │         │
//! └──────────────┴──────────────────────┴─────────────────┴─────────┘
//! ```
//!
//! [`RawPacket`] owns those bytes in a fixed-size buffer. Typed packets in
//! [`packets`](super::packets) are decoded from, and encoded into, a `RawPacket`.

use core::cell::Cell;
use core::fmt;

use heapless::Vec;

use super::MAX_PACKET_SIZE;
use super::error::PacketError;

/// Largest value the remaining length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Longest possible fixed header: one type byte and four length bytes.
pub const MAX_FIXED_HEADER_LEN: usize = 5;

/// MQTT control packet types.
///
/// Values 0 and 15 are reserved by the protocol and have no variant; code
/// that tracks "the reply we are waiting for" uses `Option<PacketType>` with
/// `None` meaning nothing is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    /// Client request to connect to the broker.
    Connect = 1,
    /// Connect acknowledgment.
    ConnAck = 2,
    /// Publish message.
    Publish = 3,
    /// Publish acknowledgment (QoS 1).
    PubAck = 4,
    /// Publish received (QoS 2, part 1).
    PubRec = 5,
    /// Publish release (QoS 2, part 2).
    PubRel = 6,
    /// Publish complete (QoS 2, part 3).
    PubComp = 7,
    /// Subscribe request.
    Subscribe = 8,
    /// Subscribe acknowledgment.
    SubAck = 9,
    /// Unsubscribe request.
    Unsubscribe = 10,
    /// Unsubscribe acknowledgment.
    UnsubAck = 11,
    /// Ping request.
    PingReq = 12,
    /// Ping response.
    PingResp = 13,
    /// Client is disconnecting.
    Disconnect = 14,
}

impl PacketType {
    /// Map the four-bit type value to a packet type.
    pub fn from_u8(value: u8) -> Option<Self> {
        let packet_type = match value {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            _ => return None,
        };
        Some(packet_type)
    }

    /// Packet type encoded in the upper nibble of a fixed header byte.
    pub fn from_header(byte: u8) -> Option<Self> {
        Self::from_u8(byte >> 4)
    }

    /// The flags nibble every packet of this type must carry.
    ///
    /// PUBLISH has variable flags; its value here is only the base.
    pub fn fixed_flags(self) -> u8 {
        match self {
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0x02,
            _ => 0x00,
        }
    }

    /// Whether the variable header of this type starts with a packet identifier.
    fn leads_with_identifier(self) -> bool {
        matches!(
            self,
            PacketType::PubAck
                | PacketType::PubRec
                | PacketType::PubRel
                | PacketType::PubComp
                | PacketType::Subscribe
                | PacketType::SubAck
                | PacketType::Unsubscribe
                | PacketType::UnsubAck
        )
    }

    /// Protocol name of the packet type.
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::ConnAck => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::PubAck => "PUBACK",
            PacketType::PubRec => "PUBREC",
            PacketType::PubRel => "PUBREL",
            PacketType::PubComp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::SubAck => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::UnsubAck => "UNSUBACK",
            PacketType::PingReq => "PINGREQ",
            PacketType::PingResp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality of Service levels for MQTT messages.
///
/// QoS defines the guarantee of delivery for a specific message. Higher QoS levels
/// provide stronger delivery guarantees but require more network overhead and
/// client state management. Levels are ordered, `AtMostOnce < AtLeastOnce < ExactlyOnce`.
///
/// # Examples
///
/// ```rust
/// use libiot_mqtt::network::application::mqtt::QoS;
///
/// assert_eq!(QoS::AtMostOnce as u8, 0);
/// assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
/// assert!(QoS::AtMostOnce < QoS::ExactlyOnce);
/// ```
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    /// **QoS 0**: At most once delivery.
    ///
    /// Fire and forget. Suited to ambient sensor data where losing an
    /// individual reading does not matter.
    AtMostOnce = 0,

    /// **QoS 1**: At least once delivery.
    ///
    /// Acknowledged with PUBACK. Duplicates can occur.
    AtLeastOnce = 1,

    /// **QoS 2**: Exactly once delivery.
    ///
    /// Four-way PUBLISH/PUBREC/PUBREL/PUBCOMP handshake. Use for messages
    /// where duplicates would cause problems.
    ExactlyOnce = 2,
}

impl QoS {
    /// Map a two-bit QoS value; 3 is reserved and yields `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Append the variable-length remaining length encoding of `len` to `buf`.
///
/// Each byte carries seven bits of the value, least significant group first;
/// bit 7 signals that another byte follows. At most four bytes are produced,
/// which limits the value to [`MAX_REMAINING_LENGTH`].
pub fn encode_remaining_length<const N: usize>(
    buf: &mut Vec<u8, N>,
    mut len: usize,
) -> Result<(), PacketError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(PacketError::MalformedLength);
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte).map_err(|_| PacketError::Capacity)?;
        if len == 0 {
            break;
        }
    }
    Ok(())
}

/// Decode a remaining length field from the start of `bytes`.
///
/// Returns the value and the number of bytes the field occupied.
pub fn decode_remaining_length(bytes: &[u8]) -> Result<(usize, usize), PacketError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in bytes.iter().enumerate() {
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if i == 3 {
            return Err(PacketError::MalformedLength);
        }
        multiplier *= 128;
    }
    Err(PacketError::TooShort)
}

/// Number of bytes the remaining length field needs for `len`.
pub fn remaining_length_len(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Append a big-endian 16-bit value.
pub(crate) fn append_u16<const N: usize>(buf: &mut Vec<u8, N>, value: u16) -> Result<(), PacketError> {
    buf.extend_from_slice(&value.to_be_bytes())
        .map_err(|_| PacketError::Capacity)
}

/// Append a length-prefixed UTF-8 string.
pub(crate) fn append_string<const N: usize>(buf: &mut Vec<u8, N>, value: &str) -> Result<(), PacketError> {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| PacketError::Capacity)?;
    append_u16(buf, len)?;
    buf.extend_from_slice(bytes).map_err(|_| PacketError::Capacity)
}

/// Read a big-endian 16-bit value at `offset`.
pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a length-prefixed UTF-8 string at `offset`.
///
/// Returns the string and the offset just past it.
pub(crate) fn read_string(buf: &[u8], offset: usize) -> Result<(&str, usize), PacketError> {
    let len = read_u16(buf, offset).ok_or(PacketError::TooShort)? as usize;
    let start = offset + 2;
    let bytes = buf.get(start..start + len).ok_or(PacketError::TooShort)?;
    let text = core::str::from_utf8(bytes).map_err(|_| PacketError::InvalidUtf8)?;
    Ok((text, start + len))
}

/// A complete or in-progress MQTT packet as raw bytes.
///
/// Once the [`Framer`](super::Framer) reports a packet complete, the buffer holds
/// exactly the fixed header, the remaining length bytes and remaining-length
/// bytes of variable header and payload. A packet flagged `too_big` was drained
/// rather than stored and its contents must not be interpreted.
#[derive(Debug, Clone, Default)]
pub struct RawPacket {
    pub(crate) data: Vec<u8, MAX_PACKET_SIZE>,
    variable_header_start: Cell<Option<usize>>,
    pub(crate) too_big: bool,
    pub(crate) error: bool,
}

impl PartialEq for RawPacket {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.too_big == other.too_big && self.error == other.error
    }
}

impl Eq for RawPacket {}

impl RawPacket {
    /// Create an empty packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a complete packet from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let data = Vec::from_slice(bytes).map_err(|_| PacketError::Capacity)?;
        Ok(Self {
            data,
            ..Self::default()
        })
    }

    /// The raw bytes, fixed header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the packet exceeded the maximum message size while being read.
    pub fn is_too_big(&self) -> bool {
        self.too_big
    }

    /// Whether the framer detected a malformed header while reading.
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Packet type from the fixed header, if it is a known type.
    pub fn packet_type(&self) -> Option<PacketType> {
        self.data.first().and_then(|b| PacketType::from_header(*b))
    }

    /// The flags nibble of the fixed header.
    pub fn flags(&self) -> u8 {
        self.data.first().map(|b| b & 0x0F).unwrap_or(0)
    }

    /// QoS stored in bits 1-2 of the fixed header.
    ///
    /// Only meaningful for PUBLISH; other types use those bits differently.
    pub fn qos(&self) -> Result<QoS, PacketError> {
        QoS::from_u8((self.flags() >> 1) & 0x03).ok_or(PacketError::InvalidQoS)
    }

    /// Whether the DUP flag (bit 3) is set.
    pub fn is_dup(&self) -> bool {
        self.flags() & 0x08 != 0
    }

    /// Whether the RETAIN flag (bit 0) is set.
    pub fn is_retain(&self) -> bool {
        self.flags() & 0x01 != 0
    }

    /// Mark the packet as a redelivery.
    pub fn set_dup_flag(&mut self) {
        if let Some(first) = self.data.first_mut() {
            *first |= 0x08;
        }
    }

    /// Value of the remaining length field.
    pub fn remaining_length(&self) -> Result<usize, PacketError> {
        let bytes = self.data.get(1..).ok_or(PacketError::TooShort)?;
        decode_remaining_length(bytes).map(|(len, _)| len)
    }

    /// Offset of the variable header, i.e. the size of the fixed header.
    ///
    /// Computed from the remaining length field on first use and cached.
    pub fn variable_header_start(&self) -> Result<usize, PacketError> {
        if let Some(start) = self.variable_header_start.get() {
            return Ok(start);
        }
        let bytes = self.data.get(1..).ok_or(PacketError::TooShort)?;
        let (_, len_bytes) = decode_remaining_length(bytes)?;
        let start = 1 + len_bytes;
        self.variable_header_start.set(Some(start));
        Ok(start)
    }

    /// Variable header and payload, everything after the fixed header.
    pub fn body(&self) -> &[u8] {
        match self.variable_header_start() {
            Ok(start) => self.data.get(start..).unwrap_or(&[]),
            Err(_) => &[],
        }
    }

    /// Packet identifier, or 0 if this type and QoS carry none.
    pub fn packet_identifier(&self) -> u16 {
        let body = self.body();
        match self.packet_type() {
            Some(PacketType::Publish) => match self.qos() {
                Ok(QoS::AtMostOnce) | Err(_) => 0,
                Ok(_) => read_u16(body, 0)
                    .and_then(|topic_len| read_u16(body, 2 + topic_len as usize))
                    .unwrap_or(0),
            },
            Some(t) if t.leads_with_identifier() => read_u16(body, 0).unwrap_or(0),
            _ => 0,
        }
    }

    /// Check the packet against its fixed header contract.
    ///
    /// Rejects drained and malformed packets, flags that do not match the
    /// packet type, remaining lengths that disagree with the buffer, and
    /// variable headers too short for the fields the type requires.
    pub fn validate_packet(&self) -> Result<(), PacketError> {
        if self.too_big {
            return Err(PacketError::TooBig);
        }
        if self.error {
            return Err(PacketError::MalformedLength);
        }
        let packet_type = self.packet_type().ok_or(PacketError::UnknownType)?;

        if packet_type == PacketType::Publish {
            // DUP must be 0 for QoS 0 messages.
            if self.qos()? == QoS::AtMostOnce && self.is_dup() {
                return Err(PacketError::InvalidFlags);
            }
        } else if self.flags() != packet_type.fixed_flags() {
            return Err(PacketError::InvalidFlags);
        }

        let start = self.variable_header_start()?;
        if self.data.len() - start != self.remaining_length()? {
            return Err(PacketError::LengthMismatch);
        }

        let body = &self.data[start..];
        let exact = |len: usize| match body.len() {
            n if n < len => Err(PacketError::TooShort),
            n if n > len => Err(PacketError::LengthMismatch),
            _ => Ok(()),
        };
        let at_least = |len: usize| {
            if body.len() < len {
                Err(PacketError::TooShort)
            } else {
                Ok(())
            }
        };

        match packet_type {
            PacketType::ConnAck
            | PacketType::PubAck
            | PacketType::PubRec
            | PacketType::PubRel
            | PacketType::PubComp
            | PacketType::UnsubAck => exact(2),
            PacketType::PingReq | PacketType::PingResp | PacketType::Disconnect => exact(0),
            // Identifier plus at least one return code.
            PacketType::SubAck => at_least(3),
            // Identifier plus one length-prefixed filter and its QoS byte.
            PacketType::Subscribe => at_least(5),
            PacketType::Unsubscribe => at_least(4),
            // Protocol name, level, flags, keep-alive and client id length.
            PacketType::Connect => at_least(12),
            PacketType::Publish => {
                let topic_len = read_u16(body, 0).ok_or(PacketError::TooShort)? as usize;
                let id_len = if self.qos()? > QoS::AtMostOnce { 2 } else { 0 };
                at_least(2 + topic_len + id_len)
            }
        }
    }

    /// Log a one-line summary of the packet at trace level.
    pub fn dump(&self, header: &str) {
        let name = self.packet_type().map(PacketType::as_str).unwrap_or("Unknown packet");
        let fixed = self.variable_header_start().unwrap_or(0);
        trace!(
            "{}: [{}] Raw({}) Fix({}) ID({}) Q({}) R({}) D({})",
            header,
            name,
            self.data.len(),
            fixed,
            self.packet_identifier(),
            (self.flags() >> 1) & 0x03,
            self.is_retain(),
            self.is_dup()
        );
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.variable_header_start.set(None);
        self.too_big = false;
        self.error = false;
    }
}
