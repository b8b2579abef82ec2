//! MQTT 3.1 packet types and codec.
//!
//! Packets decode eagerly into immutable structs. Decoding is a pure
//! function of the input buffer; encoding validates every field before any
//! byte is produced, so a failed encode never reaches the transport.

use bytes::Bytes;

use crate::error::{ProtocolError, Result, ValidationError};
use crate::validate;
use crate::varint;

/// Protocol name carried in the CONNECT variable header.
pub const PROTOCOL_NAME: &str = "MQIsdp";

/// Protocol level for MQTT 3.1.
pub const PROTOCOL_VERSION: u8 = 3;

/// Synthetic message id for packets that carry none on the wire. CONNECT
/// and PINGREQ still need a pending-store key, so they borrow this value.
pub const DEFAULT_MESSAGE_ID: u16 = 1;

/// Control packet types (high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "invalid QoS: {}",
                value
            ))),
        }
    }
}

/// CONNACK return codes.
///
/// Codes the peer sends outside the defined range map to `Unknown` rather
/// than failing the decode, so a rejection still reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
    Unknown = 0x10,
}

impl From<u8> for ConnectReturnCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUserNameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            _ => ConnectReturnCode::Unknown,
        }
    }
}

/// CONNECT variable header flag bits.
mod connect_flags {
    pub const CLEAN_SESSION: u8 = 0x02;
    pub const WILL: u8 = 0x04;
    pub const WILL_QOS_SHIFT: u8 = 3;
    pub const WILL_RETAIN: u8 = 0x20;
    pub const PASSWORD: u8 = 0x40;
    pub const USERNAME: u8 = 0x80;
}

/// MQTT packets.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { message_id: u16 },
    Pubrec { message_id: u16 },
    Pubrel { message_id: u16 },
    Pubcomp { message_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { message_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// The packet type the peer is expected to answer with, or `None` for
    /// fire-and-forget packets.
    ///
    /// A QoS 0 PUBLISH expects nothing; QoS 1 expects PUBACK; QoS 2 expects
    /// PUBREC, whose PUBREL in turn expects PUBCOMP.
    pub fn expected_response(&self) -> Option<PacketType> {
        match self {
            Packet::Connect(_) => Some(PacketType::Connack),
            Packet::Publish(p) => match p.qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce => Some(PacketType::Puback),
                QoS::ExactlyOnce => Some(PacketType::Pubrec),
            },
            Packet::Pubrec { .. } => Some(PacketType::Pubrel),
            Packet::Pubrel { .. } => Some(PacketType::Pubcomp),
            Packet::Subscribe(_) => Some(PacketType::Suback),
            Packet::Unsubscribe(_) => Some(PacketType::Unsuback),
            Packet::Pingreq => Some(PacketType::Pingresp),
            _ => None,
        }
    }

    /// Message id carried on the wire, if the packet has one.
    pub fn message_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.message_id,
            Packet::Puback { message_id }
            | Packet::Pubrec { message_id }
            | Packet::Pubrel { message_id }
            | Packet::Pubcomp { message_id }
            | Packet::Unsuback { message_id } => Some(*message_id),
            Packet::Subscribe(s) => Some(s.message_id),
            Packet::Suback(s) => Some(s.message_id),
            Packet::Unsubscribe(u) => Some(u.message_id),
            _ => None,
        }
    }

    /// Message id, substituting [`DEFAULT_MESSAGE_ID`] for id-less packets.
    pub fn message_id_or_default(&self) -> u16 {
        self.message_id().unwrap_or(DEFAULT_MESSAGE_ID)
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Will message carried in CONNECT.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub message: String,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    pub fn new(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy)]
pub struct Connack {
    pub return_code: ConnectReturnCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present only for QoS 1 and 2.
    pub message_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub message_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone)]
pub struct Suback {
    pub message_id: u16,
    /// Granted QoS, one entry per requested filter.
    pub granted: Vec<QoS>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub topics: Vec<String>,
}

/// Cursor over a packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 });
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            });
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }
}

/// Total byte length of the frame at the start of `buf`, once enough of the
/// fixed header has arrived to know it. `Ok(None)` means more bytes are
/// needed.
///
/// Transports use this to skip past a frame whose body fails to decode, so
/// one bad packet does not desynchronize the stream.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    if buf.is_empty() {
        return Ok(None);
    }
    match varint::decode(&buf[1..])? {
        Some((remaining_len, len_bytes)) => Ok(Some(1 + len_bytes + remaining_len)),
        None => Ok(None),
    }
}

/// Try to decode one complete packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` on success, `Ok(None)` when
/// the buffer holds only part of a packet, or an error for malformed input.
/// `max_message_size` bounds the remaining length; 0 disables the check.
pub fn decode_packet(buf: &[u8], max_message_size: usize) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    if max_message_size > 0 && remaining_len > max_message_size {
        return Err(ProtocolError::PacketTooLarge {
            size: remaining_len,
            max: max_message_size,
        });
    }

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;
    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(fixed_header >> 4)?;
    let body = &buf[header_len..total_len];

    // SUBSCRIBE, UNSUBSCRIBE, and PUBREL carry fixed flags 0b0010.
    if matches!(
        packet_type,
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Pubrel
    ) && flags != 0x02
    {
        return Err(ProtocolError::MalformedPacket(format!(
            "{:?} fixed header flags must be 0x02, got {:#04x}",
            packet_type, flags
        )));
    }

    let packet = match packet_type {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => Packet::Puback {
            message_id: decode_message_id(body)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            message_id: decode_message_id(body)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            message_id: decode_message_id(body)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            message_id: decode_message_id(body)?,
        },
        PacketType::Subscribe => decode_subscribe(body)?,
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsubscribe => decode_unsubscribe(body)?,
        PacketType::Unsuback => Packet::Unsuback {
            message_id: decode_message_id(body)?,
        },
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    Ok(Some((packet, total_len)))
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    if protocol_name != PROTOCOL_NAME && protocol_name != "MQTT" {
        return Err(ProtocolError::InvalidProtocolName);
    }
    let version = dec.read_u8()?;
    if version != PROTOCOL_VERSION && version != 4 {
        return Err(ProtocolError::UnsupportedProtocolVersion(version));
    }

    let flags = dec.read_u8()?;
    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if flags & connect_flags::WILL != 0 {
        let topic = dec.read_string()?;
        let message = dec.read_string()?;
        let qos = QoS::try_from((flags >> connect_flags::WILL_QOS_SHIFT) & 0x03)?;
        Some(Will {
            topic,
            message,
            qos,
            retain: flags & connect_flags::WILL_RETAIN != 0,
        })
    } else {
        None
    };

    let username = if flags & connect_flags::USERNAME != 0 {
        Some(dec.read_string()?)
    } else {
        None
    };
    let password = if flags & connect_flags::PASSWORD != 0 {
        Some(dec.read_string()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        clean_session: flags & connect_flags::CLEAN_SESSION != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    // First byte is reserved.
    dec.read_u8()?;
    let return_code = ConnectReturnCode::from(dec.read_u8()?);
    Ok(Packet::Connack(Connack { return_code }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = flags & 0x08 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;

    let mut dec = Decoder::new(body);
    let topic = dec.read_string()?;
    let message_id = if qos > QoS::AtMostOnce {
        Some(dec.read_u16()?)
    } else {
        None
    };
    let payload = Bytes::copy_from_slice(dec.rest());

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        message_id,
        payload,
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let message_id = dec.read_u16()?;
    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        let qos = QoS::try_from(dec.read_u8()?)?;
        topics.push((topic, qos));
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBSCRIBE with no topic filters".into(),
        ));
    }
    Ok(Packet::Subscribe(Subscribe { message_id, topics }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let message_id = dec.read_u16()?;
    let mut granted = Vec::new();
    while dec.remaining() > 0 {
        granted.push(QoS::try_from(dec.read_u8()?)?);
    }
    Ok(Packet::Suback(Suback {
        message_id,
        granted,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let message_id = dec.read_u16()?;
    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        topics.push(dec.read_string()?);
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE with no topic filters".into(),
        ));
    }
    Ok(Packet::Unsubscribe(Unsubscribe { message_id, topics }))
}

fn decode_message_id(body: &[u8]) -> Result<u16> {
    Decoder::new(body).read_u16()
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn write_string(
    buf: &mut Vec<u8>,
    value: &str,
    field: &'static str,
) -> std::result::Result<(), ValidationError> {
    validate::validate_string(value, field)?;
    write_u16(buf, value.len() as u16);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_required_string(
    buf: &mut Vec<u8>,
    value: &str,
    field: &'static str,
) -> std::result::Result<(), ValidationError> {
    validate::validate_required_string(value, field)?;
    write_u16(buf, value.len() as u16);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Encode a packet into a freshly allocated buffer.
///
/// All field validation happens here, before any byte leaves the process.
/// `max_message_size` bounds the remaining length; 0 disables the check.
pub fn encode_packet(
    packet: &Packet,
    max_message_size: usize,
) -> std::result::Result<Vec<u8>, ValidationError> {
    let mut body = Vec::new();

    let first_byte: u8 = match packet {
        Packet::Connect(c) => {
            encode_connect(c, &mut body)?;
            0x10
        }
        Packet::Connack(c) => {
            body.push(0);
            body.push(c.return_code as u8);
            0x20
        }
        Packet::Publish(p) => {
            encode_publish(p, &mut body)?;
            0x30 | (p.dup as u8) << 3 | (p.qos as u8) << 1 | p.retain as u8
        }
        Packet::Puback { message_id } => {
            encode_message_id(*message_id, &mut body)?;
            0x40
        }
        Packet::Pubrec { message_id } => {
            encode_message_id(*message_id, &mut body)?;
            0x50
        }
        Packet::Pubrel { message_id } => {
            encode_message_id(*message_id, &mut body)?;
            0x62
        }
        Packet::Pubcomp { message_id } => {
            encode_message_id(*message_id, &mut body)?;
            0x70
        }
        Packet::Subscribe(s) => {
            encode_subscribe(s, &mut body)?;
            0x82
        }
        Packet::Suback(s) => {
            validate::validate_message_id(s.message_id)?;
            write_u16(&mut body, s.message_id);
            for qos in &s.granted {
                body.push(*qos as u8);
            }
            0x90
        }
        Packet::Unsubscribe(u) => {
            encode_unsubscribe(u, &mut body)?;
            0xA2
        }
        Packet::Unsuback { message_id } => {
            encode_message_id(*message_id, &mut body)?;
            0xB0
        }
        Packet::Pingreq => 0xC0,
        Packet::Pingresp => 0xD0,
        Packet::Disconnect => 0xE0,
    };

    if max_message_size > 0 && body.len() > max_message_size {
        return Err(ValidationError::MessageTooLarge {
            size: body.len(),
            max: max_message_size,
        });
    }

    let mut out = Vec::with_capacity(1 + varint::encoded_len(body.len() as u32) + body.len());
    out.push(first_byte);
    varint::encode_to_vec(body.len() as u32, &mut out);
    out.extend_from_slice(&body);
    Ok(out)
}

fn encode_connect(c: &Connect, body: &mut Vec<u8>) -> std::result::Result<(), ValidationError> {
    validate::validate_client_id(&c.client_id)?;

    let mut flags = 0u8;
    if c.clean_session {
        flags |= connect_flags::CLEAN_SESSION;
    }
    if let Some(will) = &c.will {
        flags |= connect_flags::WILL;
        flags |= (will.qos as u8) << connect_flags::WILL_QOS_SHIFT;
        if will.retain {
            flags |= connect_flags::WILL_RETAIN;
        }
    }
    if c.username.is_some() {
        flags |= connect_flags::USERNAME;
    }
    if c.password.is_some() {
        flags |= connect_flags::PASSWORD;
    }

    write_string(body, PROTOCOL_NAME, "protocol name")?;
    body.push(PROTOCOL_VERSION);
    body.push(flags);
    write_u16(body, c.keep_alive);
    write_string(body, &c.client_id, "client id")?;

    if let Some(will) = &c.will {
        write_required_string(body, &will.topic, "will topic")?;
        write_string(body, &will.message, "will message")?;
    }
    if let Some(username) = &c.username {
        write_required_string(body, username, "username")?;
    }
    if let Some(password) = &c.password {
        write_string(body, password, "password")?;
    }
    Ok(())
}

fn encode_publish(p: &Publish, body: &mut Vec<u8>) -> std::result::Result<(), ValidationError> {
    write_required_string(body, &p.topic, "topic")?;
    if p.qos > QoS::AtMostOnce {
        let id = p.message_id.ok_or(ValidationError::MissingMessageId)?;
        validate::validate_message_id(id)?;
        write_u16(body, id);
    }
    body.extend_from_slice(&p.payload);
    Ok(())
}

fn encode_subscribe(s: &Subscribe, body: &mut Vec<u8>) -> std::result::Result<(), ValidationError> {
    validate::validate_message_id(s.message_id)?;
    write_u16(body, s.message_id);
    for (topic, qos) in &s.topics {
        write_required_string(body, topic, "topic filter")?;
        body.push(*qos as u8);
    }
    Ok(())
}

fn encode_unsubscribe(
    u: &Unsubscribe,
    body: &mut Vec<u8>,
) -> std::result::Result<(), ValidationError> {
    validate::validate_message_id(u.message_id)?;
    write_u16(body, u.message_id);
    for topic in &u.topics {
        write_required_string(body, topic, "topic filter")?;
    }
    Ok(())
}

fn encode_message_id(id: u16, body: &mut Vec<u8>) -> std::result::Result<(), ValidationError> {
    validate::validate_message_id(id)?;
    write_u16(body, id);
    Ok(())
}
