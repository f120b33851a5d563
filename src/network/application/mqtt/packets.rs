//! Typed MQTT control packets.
//!
//! Outbound packets implement [`Encode`]; inbound packets are produced by
//! [`Packet::decode`], which classifies a completed [`RawPacket`], builds the
//! matching typed packet and validates it before it reaches the state machine.

use heapless::{String, Vec};

use super::error::{Error, PacketError};
use super::packet::{
    PacketType, QoS, RawPacket, append_string, append_u16, encode_remaining_length, read_string,
    read_u16,
};
use super::{MAX_PAYLOAD_LEN, MAX_TOPIC_LEN};

/// Protocol name carried in CONNECT.
const PROTOCOL_NAME: &str = "MQTT";
/// MQTT protocol level for version 3.1.1.
const PROTOCOL_LEVEL: u8 = 4;

/// Return codes a SUBACK can carry per topic filter; one filter per SUBSCRIBE here.
pub const MAX_SUBACK_CODES: usize = 8;

/// SUBACK return code signalling a refused subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Serialization of a typed packet into a [`RawPacket`].
pub trait Encode {
    /// Packet type written to the fixed header.
    const TYPE: PacketType;

    /// Flags nibble of the fixed header.
    fn flags(&self) -> u8 {
        Self::TYPE.fixed_flags()
    }

    /// Length of variable header plus payload.
    fn body_len(&self) -> usize;

    /// Append variable header and payload.
    fn write_body<const N: usize>(&self, buf: &mut Vec<u8, N>) -> Result<(), PacketError>;

    /// Build the complete packet.
    fn encode(&self) -> Result<RawPacket, PacketError> {
        let mut raw = RawPacket::new();
        raw.data
            .push(((Self::TYPE as u8) << 4) | self.flags())
            .map_err(|_| PacketError::Capacity)?;
        encode_remaining_length(&mut raw.data, self.body_len())?;
        self.write_body(&mut raw.data)?;
        Ok(raw)
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReturnCode {
    /// Connection accepted.
    Accepted,
    /// The broker does not support protocol level 4.
    UnacceptableProtocolVersion,
    /// The client identifier is not allowed.
    IdentifierRejected,
    /// The MQTT service is unavailable.
    ServerUnavailable,
    /// Malformed user name or password.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// A code outside the range defined for 3.1.1.
    Reserved(u8),
}

impl ConnectReturnCode {
    /// Map the wire value.
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUserNameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            other => ConnectReturnCode::Reserved(other),
        }
    }

    /// The wire value.
    pub fn to_u8(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUserNameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Reserved(other) => other,
        }
    }

    /// Whether the broker accepted the connection.
    pub fn is_accepted(self) -> bool {
        self == ConnectReturnCode::Accepted
    }

    /// Human readable reason.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectReturnCode::Accepted => "accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadUserNameOrPassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
            ConnectReturnCode::Reserved(_) => "reserved return code",
        }
    }
}

/// CONNECT. Will, user name and password are not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect<'a> {
    /// Client identifier.
    pub client_id: &'a str,
    /// Keep-alive interval in seconds, 0 disables it.
    pub keep_alive_seconds: u16,
    /// Ask the broker to discard any previous session.
    pub clean_session: bool,
}

impl Encode for Connect<'_> {
    const TYPE: PacketType = PacketType::Connect;

    fn body_len(&self) -> usize {
        2 + PROTOCOL_NAME.len() + 1 + 1 + 2 + 2 + self.client_id.len()
    }

    fn write_body<const N: usize>(&self, buf: &mut Vec<u8, N>) -> Result<(), PacketError> {
        append_string(buf, PROTOCOL_NAME)?;
        let connect_flags = if self.clean_session { 0x02 } else { 0x00 };
        buf.extend_from_slice(&[PROTOCOL_LEVEL, connect_flags])
            .map_err(|_| PacketError::Capacity)?;
        append_u16(buf, self.keep_alive_seconds)?;
        append_string(buf, self.client_id)
    }
}

/// CONNACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// The broker resumed a stored session.
    pub session_present: bool,
    /// Outcome of the connection attempt.
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    fn decode(body: &[u8]) -> Result<Self, PacketError> {
        match body {
            [ack_flags, code, ..] => Ok(Self {
                session_present: ack_flags & 0x01 != 0,
                return_code: ConnectReturnCode::from_u8(*code),
            }),
            _ => Err(PacketError::TooShort),
        }
    }
}

impl Encode for ConnAck {
    const TYPE: PacketType = PacketType::ConnAck;

    fn body_len(&self) -> usize {
        2
    }

    fn write_body<const N: usize>(&self, buf: &mut Vec<u8, N>) -> Result<(), PacketError> {
        buf.extend_from_slice(&[self.session_present as u8, self.return_code.to_u8()])
            .map_err(|_| PacketError::Capacity)
    }
}

/// PUBLISH, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Topic name.
    pub topic: String<MAX_TOPIC_LEN>,
    /// Application payload.
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Broker should retain the message.
    pub retain: bool,
    /// This is a redelivery.
    pub dup: bool,
    /// Packet identifier, 0 for QoS 0.
    pub packet_id: u16,
}

impl Publish {
    /// Build an outgoing publish, checking the buffer limits.
    pub fn new(topic: &str, payload: &[u8], qos: QoS, retain: bool, packet_id: u16) -> Result<Self, Error> {
        Ok(Self {
            topic: String::try_from(topic).map_err(|_| Error::TopicTooLong)?,
            payload: Vec::from_slice(payload).map_err(|_| Error::PayloadTooLarge)?,
            qos,
            retain,
            dup: false,
            packet_id,
        })
    }

    fn decode(raw: &RawPacket) -> Result<Self, PacketError> {
        let body = raw.body();
        let qos = raw.qos()?;
        let (topic, mut offset) = read_string(body, 0)?;
        let packet_id = if qos > QoS::AtMostOnce {
            let id = read_u16(body, offset).ok_or(PacketError::TooShort)?;
            offset += 2;
            id
        } else {
            0
        };
        Ok(Self {
            topic: String::try_from(topic).map_err(|_| PacketError::Capacity)?,
            payload: Vec::from_slice(&body[offset..]).map_err(|_| PacketError::Capacity)?,
            qos,
            retain: raw.is_retain(),
            dup: raw.is_dup(),
            packet_id,
        })
    }
}

impl Encode for Publish {
    const TYPE: PacketType = PacketType::Publish;

    fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.retain {
            flags |= 0x01;
        }
        if self.dup {
            flags |= 0x08;
        }
        flags
    }

    fn body_len(&self) -> usize {
        let id_len = if self.qos > QoS::AtMostOnce { 2 } else { 0 };
        2 + self.topic.len() + id_len + self.payload.len()
    }

    fn write_body<const N: usize>(&self, buf: &mut Vec<u8, N>) -> Result<(), PacketError> {
        append_string(buf, &self.topic)?;
        if self.qos > QoS::AtMostOnce {
            append_u16(buf, self.packet_id)?;
        }
        buf.extend_from_slice(&self.payload)
            .map_err(|_| PacketError::Capacity)
    }
}

// Acknowledgments that carry nothing but a packet identifier.
macro_rules! identifier_packet {
    ($(#[$doc:meta])* $name:ident, $packet_type:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// Packet identifier being acknowledged.
            pub packet_id: u16,
        }

        impl $name {
            fn decode(body: &[u8]) -> Result<Self, PacketError> {
                let packet_id = read_u16(body, 0).ok_or(PacketError::TooShort)?;
                Ok(Self { packet_id })
            }
        }

        impl Encode for $name {
            const TYPE: PacketType = $packet_type;

            fn body_len(&self) -> usize {
                2
            }

            fn write_body<const N: usize>(&self, buf: &mut Vec<u8, N>) -> Result<(), PacketError> {
                append_u16(buf, self.packet_id)
            }
        }
    };
}

identifier_packet!(
    /// PUBACK, completes a QoS 1 publish.
    PubAck,
    PacketType::PubAck
);
identifier_packet!(
    /// PUBREC, first reply in a QoS 2 publish.
    PubRec,
    PacketType::PubRec
);
identifier_packet!(
    /// PUBREL, releases a QoS 2 message for delivery.
    PubRel,
    PacketType::PubRel
);
identifier_packet!(
    /// PUBCOMP, completes a QoS 2 publish.
    PubComp,
    PacketType::PubComp
);
identifier_packet!(
    /// UNSUBACK.
    UnsubAck,
    PacketType::UnsubAck
);

/// SUBSCRIBE for a single topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Packet identifier.
    pub packet_id: u16,
    /// Topic filter, wildcards allowed.
    pub topic: String<MAX_TOPIC_LEN>,
    /// Requested maximum QoS.
    pub qos: QoS,
}

impl Encode for Subscribe {
    const TYPE: PacketType = PacketType::Subscribe;

    fn body_len(&self) -> usize {
        2 + 2 + self.topic.len() + 1
    }

    fn write_body<const N: usize>(&self, buf: &mut Vec<u8, N>) -> Result<(), PacketError> {
        append_u16(buf, self.packet_id)?;
        append_string(buf, &self.topic)?;
        buf.push(self.qos as u8).map_err(|_| PacketError::Capacity)
    }
}

/// SUBACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier of the SUBSCRIBE.
    pub packet_id: u16,
    /// Granted QoS per filter, or [`SUBACK_FAILURE`].
    pub return_codes: Vec<u8, MAX_SUBACK_CODES>,
}

impl SubAck {
    /// QoS granted for the first filter, `None` when refused.
    pub fn granted_qos(&self) -> Option<QoS> {
        self.return_codes.first().and_then(|code| QoS::from_u8(*code))
    }

    fn decode(body: &[u8]) -> Result<Self, PacketError> {
        let packet_id = read_u16(body, 0).ok_or(PacketError::TooShort)?;
        let codes = body.get(2..).ok_or(PacketError::TooShort)?;
        Ok(Self {
            packet_id,
            return_codes: Vec::from_slice(codes).map_err(|_| PacketError::Capacity)?,
        })
    }
}

impl Encode for SubAck {
    const TYPE: PacketType = PacketType::SubAck;

    fn body_len(&self) -> usize {
        2 + self.return_codes.len()
    }

    fn write_body<const N: usize>(&self, buf: &mut Vec<u8, N>) -> Result<(), PacketError> {
        append_u16(buf, self.packet_id)?;
        buf.extend_from_slice(&self.return_codes)
            .map_err(|_| PacketError::Capacity)
    }
}

/// UNSUBSCRIBE for a single topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Packet identifier.
    pub packet_id: u16,
    /// Topic filter to remove.
    pub topic: String<MAX_TOPIC_LEN>,
}

impl Encode for Unsubscribe {
    const TYPE: PacketType = PacketType::Unsubscribe;

    fn body_len(&self) -> usize {
        2 + 2 + self.topic.len()
    }

    fn write_body<const N: usize>(&self, buf: &mut Vec<u8, N>) -> Result<(), PacketError> {
        append_u16(buf, self.packet_id)?;
        append_string(buf, &self.topic)
    }
}

macro_rules! empty_packet {
    ($(#[$doc:meta])* $name:ident, $packet_type:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl Encode for $name {
            const TYPE: PacketType = $packet_type;

            fn body_len(&self) -> usize {
                0
            }

            fn write_body<const N: usize>(&self, _buf: &mut Vec<u8, N>) -> Result<(), PacketError> {
                Ok(())
            }
        }
    };
}

empty_packet!(
    /// PINGREQ.
    PingReq,
    PacketType::PingReq
);
empty_packet!(
    /// PINGRESP.
    PingResp,
    PacketType::PingResp
);
empty_packet!(
    /// DISCONNECT.
    Disconnect,
    PacketType::Disconnect
);

/// A packet a client can receive from the broker.
///
/// Connection states match on this exhaustively; arms a state does not care
/// about are explicit no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Connect acknowledgment.
    ConnAck(ConnAck),
    /// Application message.
    Publish(Publish),
    /// QoS 1 acknowledgment.
    PubAck(PubAck),
    /// QoS 2 step one.
    PubRec(PubRec),
    /// QoS 2 step two.
    PubRel(PubRel),
    /// QoS 2 step three.
    PubComp(PubComp),
    /// Subscribe acknowledgment.
    SubAck(SubAck),
    /// Unsubscribe acknowledgment.
    UnsubAck(UnsubAck),
    /// Ping response.
    PingResp,
}

impl Packet {
    /// Build and validate the typed packet for a completed raw packet.
    ///
    /// Packets that were drained as oversized, have a type a broker never
    /// sends to a client, or fail validation are rejected.
    pub fn decode(raw: &RawPacket) -> Result<Self, PacketError> {
        if raw.is_too_big() {
            return Err(PacketError::TooBig);
        }
        let packet_type = raw.packet_type().ok_or(PacketError::UnknownType)?;
        let body = raw.body();
        let packet = match packet_type {
            PacketType::ConnAck => Packet::ConnAck(ConnAck::decode(body)?),
            PacketType::Publish => Packet::Publish(Publish::decode(raw)?),
            PacketType::PubAck => Packet::PubAck(PubAck::decode(body)?),
            PacketType::PubRec => Packet::PubRec(PubRec::decode(body)?),
            PacketType::PubRel => Packet::PubRel(PubRel::decode(body)?),
            PacketType::PubComp => Packet::PubComp(PubComp::decode(body)?),
            PacketType::SubAck => Packet::SubAck(SubAck::decode(body)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::decode(body)?),
            PacketType::PingResp => Packet::PingResp,
            _ => return Err(PacketError::UnknownType),
        };
        raw.validate_packet()?;
        Ok(packet)
    }

    /// Type of the packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingResp => PacketType::PingResp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_layout() {
        let connect = Connect {
            client_id: "dev1",
            keep_alive_seconds: 60,
            clean_session: true,
        };
        let raw = connect.encode().unwrap();
        assert_eq!(
            raw.as_bytes(),
            &[
                0x10, 0x10, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04,
                b'd', b'e', b'v', b'1'
            ]
        );
        assert_eq!(raw.validate_packet(), Ok(()));
    }

    #[test]
    fn publish_flags() {
        let mut publish = Publish::new("a/b", b"x", QoS::ExactlyOnce, true, 9).unwrap();
        assert_eq!(publish.encode().unwrap().as_bytes()[0], 0x35);
        publish.dup = true;
        let raw = publish.encode().unwrap();
        assert_eq!(raw.as_bytes()[0], 0x3D);
        assert_eq!(raw.packet_identifier(), 9);
    }

    #[test]
    fn qos0_publish_has_no_identifier_field() {
        let publish = Publish::new("t", b"hi", QoS::AtMostOnce, false, 0).unwrap();
        let raw = publish.encode().unwrap();
        assert_eq!(raw.as_bytes(), &[0x30, 0x05, 0x00, 0x01, b't', b'h', b'i']);
    }

    #[test]
    fn publish_limits() {
        let long_topic = [b'a'; MAX_TOPIC_LEN + 1];
        let topic = core::str::from_utf8(&long_topic).unwrap();
        assert_eq!(
            Publish::new(topic, b"", QoS::AtMostOnce, false, 0),
            Err(Error::TopicTooLong)
        );
        let payload = [0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            Publish::new("t", &payload, QoS::AtMostOnce, false, 0),
            Err(Error::PayloadTooLarge)
        );
    }

    #[test]
    fn subscribe_layout() {
        let subscribe = Subscribe {
            packet_id: 1,
            topic: String::try_from("a/#").unwrap(),
            qos: QoS::AtLeastOnce,
        };
        assert_eq!(
            subscribe.encode().unwrap().as_bytes(),
            &[0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'#', 0x01]
        );
    }

    #[test]
    fn decode_inbound_packets() {
        let raw = RawPacket::from_bytes(&[0x20, 0x02, 0x01, 0x05]).unwrap();
        assert_eq!(
            Packet::decode(&raw),
            Ok(Packet::ConnAck(ConnAck {
                session_present: true,
                return_code: ConnectReturnCode::NotAuthorized,
            }))
        );

        let raw = RawPacket::from_bytes(&[0x90, 0x03, 0x00, 0x01, 0x80]).unwrap();
        match Packet::decode(&raw) {
            Ok(Packet::SubAck(suback)) => assert_eq!(suback.granted_qos(), None),
            other => panic!("unexpected {:?}", other),
        }

        let raw = RawPacket::from_bytes(&[0x32, 0x08, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07, b'x']).unwrap();
        match Packet::decode(&raw) {
            Ok(Packet::Publish(publish)) => {
                assert_eq!(publish.topic.as_str(), "a/b");
                assert_eq!(&publish.payload[..], b"x");
                assert_eq!(publish.qos, QoS::AtLeastOnce);
                assert_eq!(publish.packet_id, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_client_bound_types_only() {
        // A SUBSCRIBE is never sent to a client
        let raw = RawPacket::from_bytes(&[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00]).unwrap();
        assert_eq!(Packet::decode(&raw), Err(PacketError::UnknownType));

        // Reserved type 15
        let raw = RawPacket::from_bytes(&[0xF0, 0x00]).unwrap();
        assert_eq!(Packet::decode(&raw), Err(PacketError::UnknownType));

        // PUBREL with the wrong flags decodes but fails validation
        let raw = RawPacket::from_bytes(&[0x60, 0x02, 0x00, 0x01]).unwrap();
        assert_eq!(Packet::decode(&raw), Err(PacketError::InvalidFlags));
    }
}
