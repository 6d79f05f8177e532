//! Outgoing packets, serialized once into an exactly sized buffer.
//!
//! Every constructor computes the remaining length first, derives the header size
//! from it and then allocates a single buffer. PUBLISH packets whose payload comes
//! from a [`PayloadProducer`] only keep a bounded window of the payload in memory;
//! [`Packet::available`] pulls the next window when the writer gets there.

use bytes::BufMut;
use std::fmt;
use tracing::{trace, warn};

use super::base_data::{BinaryData, Utf8String, VariableByteInteger};
use super::control_packet::{ControlPacketType, QoS};
use super::{connect_flag, publish_flag, PROTOCOL_LEVEL, PROTOCOL_NAME};

/// Window size for producer-driven PUBLISH payloads when nothing else is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 1440;

/// Why a packet could not be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    OutOfMemory,
    MalformedParameter(&'static str),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::OutOfMemory => write!(f, "out of memory"),
            BuildError::MalformedParameter(what) => write!(f, "malformed parameter: {}", what),
        }
    }
}

impl std::error::Error for BuildError {}

/// Supplies PUBLISH payload bytes on demand.
///
/// `produce` copies payload bytes starting at `offset` (relative to the start of the
/// payload) into `buf` and returns how many it wrote. Returning fewer bytes than
/// `buf.len()` is fine; returning 0 stalls the write until the next attempt. A
/// retransmission asks for the same offsets again.
pub trait PayloadProducer: Send {
    fn produce(&mut self, offset: usize, buf: &mut [u8]) -> usize;
}

impl<F> PayloadProducer for F
where
    F: FnMut(usize, &mut [u8]) -> usize + Send,
{
    fn produce(&mut self, offset: usize, buf: &mut [u8]) -> usize {
        self(offset, buf)
    }
}

/// Last will carried by a CONNECT packet.
#[derive(Debug, Clone, Copy)]
pub struct Will<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

/// Everything a CONNECT packet is made of.
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams<'a> {
    pub client_id: &'a str,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
    pub will: Option<Will<'a>>,
}

struct ChunkedPayload {
    producer: Box<dyn PayloadProducer>,
    // offset in the packet where the payload starts
    payload_start: usize,
    // packet offset of the first byte held in the buffer, and how many are held
    window_start: usize,
    window_len: usize,
}

impl ChunkedPayload {
    fn fill(&mut self, data: &mut [u8], index: usize, size: usize) {
        let capacity = data.len() - self.payload_start;
        let want = capacity.min(size - index);
        let buf = &mut data[self.payload_start..self.payload_start + want];
        let produced = self
            .producer
            .produce(index - self.payload_start, buf)
            .min(want);
        trace!(offset = index - self.payload_start, produced, "payload window refilled");
        self.window_start = index;
        self.window_len = produced;
    }
}

/// A serialized outgoing packet.
pub struct Packet {
    kind: ControlPacketType,
    packet_id: u16,
    data: Vec<u8>,
    size: usize,
    chunked: Option<ChunkedPayload>,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("packet_id", &self.packet_id)
            .field("size", &self.size)
            .field("chunked", &self.chunked.is_some())
            .finish()
    }
}

fn check_string(s: &[u8], what: &'static str) -> Result<(), BuildError> {
    if s.len() > u16::MAX as usize {
        return Err(BuildError::MalformedParameter(what));
    }
    Ok(())
}

fn check_topic(topic: &str) -> Result<(), BuildError> {
    if topic.is_empty() {
        return Err(BuildError::MalformedParameter("empty topic"));
    }
    check_string(topic.as_bytes(), "topic too long")
}

impl Packet {
    /// Allocates the buffer and writes the fixed header.
    ///
    /// `buffered` is how much of the remaining length will live in the buffer; it is
    /// smaller than `remaining_length` only for producer-driven payloads.
    fn with_header(
        kind: ControlPacketType,
        flags: u8,
        packet_id: u16,
        remaining_length: usize,
        buffered: usize,
    ) -> Result<Self, BuildError> {
        let length_len = VariableByteInteger::encode_length_in_bytes(remaining_length);
        if length_len == 0 {
            return Err(BuildError::MalformedParameter("packet too large"));
        }
        let mut data = Vec::new();
        data.try_reserve_exact(1 + length_len + buffered)
            .map_err(|_| BuildError::OutOfMemory)?;
        data.put_u8(kind.header_bits() | flags);
        VariableByteInteger::encode(remaining_length, &mut data);
        Ok(Self {
            kind,
            packet_id,
            data,
            size: 1 + length_len + remaining_length,
            chunked: None,
        })
    }

    pub fn connect(params: &ConnectParams<'_>) -> Result<Self, BuildError> {
        if params.client_id.is_empty() {
            return Err(BuildError::MalformedParameter("empty client id"));
        }
        check_string(params.client_id.as_bytes(), "client id too long")?;
        if params.password.is_some() && params.username.is_none() {
            return Err(BuildError::MalformedParameter("password without username"));
        }

        let mut flags = 0u8;
        if params.clean_session {
            flags |= connect_flag::CLEAN_SESSION;
        }
        let mut remaining_length = 10 + BinaryData::encoded_len(params.client_id.as_bytes());

        let will = match params.will {
            Some(will) => {
                check_topic(will.topic)?;
                let mut payload = will.payload;
                if payload.len() > u16::MAX as usize {
                    warn!(
                        length = payload.len(),
                        "will payload too long, truncating to 65535 bytes"
                    );
                    payload = &payload[..u16::MAX as usize];
                }
                flags |= connect_flag::WILL;
                flags |= match will.qos {
                    QoS::AtMostOnce => 0,
                    QoS::AtLeastOnce => connect_flag::WILL_QOS1,
                    QoS::ExactlyOnce => connect_flag::WILL_QOS2,
                };
                if will.retain {
                    flags |= connect_flag::WILL_RETAIN;
                }
                remaining_length += BinaryData::encoded_len(will.topic.as_bytes())
                    + BinaryData::encoded_len(payload);
                Some((will.topic, payload))
            }
            None => None,
        };
        if let Some(username) = params.username {
            check_string(username.as_bytes(), "username too long")?;
            flags |= connect_flag::USERNAME;
            remaining_length += BinaryData::encoded_len(username.as_bytes());
        }
        if let Some(password) = params.password {
            check_string(password, "password too long")?;
            flags |= connect_flag::PASSWORD;
            remaining_length += BinaryData::encoded_len(password);
        }

        let mut packet = Self::with_header(
            ControlPacketType::CONNECT,
            0,
            0,
            remaining_length,
            remaining_length,
        )?;
        let out = &mut packet.data;
        Utf8String::encode(PROTOCOL_NAME, out);
        out.put_u8(PROTOCOL_LEVEL);
        out.put_u8(flags);
        out.put_u16(params.keep_alive);
        Utf8String::encode(params.client_id, out);
        if let Some((topic, payload)) = will {
            Utf8String::encode(topic, out);
            BinaryData::encode(payload, out);
        }
        if let Some(username) = params.username {
            Utf8String::encode(username, out);
        }
        if let Some(password) = params.password {
            BinaryData::encode(password, out);
        }
        Ok(packet)
    }

    /// PUBLISH with the payload copied into the packet. QoS 0 packets never carry an id.
    pub fn publish(
        packet_id: u16,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<Self, BuildError> {
        let (mut packet, _) =
            Self::publish_header(packet_id, topic, qos, retain, payload.len(), payload.len())?;
        packet.data.put_slice(payload);
        Ok(packet)
    }

    /// PUBLISH whose `payload_len` bytes are pulled from `producer`, at most
    /// `chunk_size` at a time.
    pub fn publish_chunked(
        packet_id: u16,
        topic: &str,
        qos: QoS,
        retain: bool,
        producer: Box<dyn PayloadProducer>,
        payload_len: usize,
        chunk_size: usize,
    ) -> Result<Self, BuildError> {
        if chunk_size == 0 {
            return Err(BuildError::MalformedParameter("chunk size must not be 0"));
        }
        let buffered = payload_len.min(chunk_size);
        let (mut packet, payload_start) =
            Self::publish_header(packet_id, topic, qos, retain, payload_len, buffered)?;
        packet.data.resize(payload_start + buffered, 0);
        packet.chunked = Some(ChunkedPayload {
            producer,
            payload_start,
            window_start: payload_start,
            window_len: 0,
        });
        Ok(packet)
    }

    fn publish_header(
        packet_id: u16,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload_len: usize,
        buffered: usize,
    ) -> Result<(Self, usize), BuildError> {
        check_topic(topic)?;
        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            _ if packet_id == 0 => {
                return Err(BuildError::MalformedParameter("QoS > 0 needs a packet id"))
            }
            _ => packet_id,
        };
        let id_len = if packet_id != 0 { 2 } else { 0 };
        let header_len = BinaryData::encoded_len(topic.as_bytes()) + id_len;
        let remaining_length = header_len
            .checked_add(payload_len)
            .ok_or(BuildError::MalformedParameter("payload too long"))?;

        let mut flags = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => publish_flag::QOS1,
            QoS::ExactlyOnce => publish_flag::QOS2,
        };
        if retain {
            flags |= publish_flag::RETAIN;
        }
        let mut packet = Self::with_header(
            ControlPacketType::PUBLISH,
            flags,
            packet_id,
            remaining_length,
            header_len + buffered,
        )?;
        Utf8String::encode(topic, &mut packet.data);
        if packet_id != 0 {
            packet.data.put_u16(packet_id);
        }
        let payload_start = packet.data.len();
        Ok((packet, payload_start))
    }

    pub fn subscribe(packet_id: u16, topics: &[(&str, QoS)]) -> Result<Self, BuildError> {
        if topics.is_empty() {
            return Err(BuildError::MalformedParameter("no topics"));
        }
        if packet_id == 0 {
            return Err(BuildError::MalformedParameter("SUBSCRIBE needs a packet id"));
        }
        let mut remaining_length = 2;
        for (topic, _) in topics {
            check_topic(topic)?;
            remaining_length += BinaryData::encoded_len(topic.as_bytes()) + 1;
        }
        let kind = ControlPacketType::SUBSCRIBE;
        let mut packet = Self::with_header(
            kind,
            kind.reserved_flags(),
            packet_id,
            remaining_length,
            remaining_length,
        )?;
        packet.data.put_u16(packet_id);
        for (topic, qos) in topics {
            Utf8String::encode(topic, &mut packet.data);
            packet.data.put_u8(qos.as_u8());
        }
        Ok(packet)
    }

    pub fn unsubscribe(packet_id: u16, topics: &[&str]) -> Result<Self, BuildError> {
        if topics.is_empty() {
            return Err(BuildError::MalformedParameter("no topics"));
        }
        if packet_id == 0 {
            return Err(BuildError::MalformedParameter("UNSUBSCRIBE needs a packet id"));
        }
        let mut remaining_length = 2;
        for topic in topics {
            check_topic(topic)?;
            remaining_length += BinaryData::encoded_len(topic.as_bytes());
        }
        let kind = ControlPacketType::UNSUBSCRIBE;
        let mut packet = Self::with_header(
            kind,
            kind.reserved_flags(),
            packet_id,
            remaining_length,
            remaining_length,
        )?;
        packet.data.put_u16(packet_id);
        for topic in topics {
            Utf8String::encode(topic, &mut packet.data);
        }
        Ok(packet)
    }

    /// PUBACK, PUBREC, PUBREL or PUBCOMP for `packet_id`.
    pub fn ack(kind: ControlPacketType, packet_id: u16) -> Result<Self, BuildError> {
        if !matches!(
            kind,
            ControlPacketType::PUBACK
                | ControlPacketType::PUBREC
                | ControlPacketType::PUBREL
                | ControlPacketType::PUBCOMP
        ) {
            return Err(BuildError::MalformedParameter("not an acknowledgement"));
        }
        if packet_id == 0 {
            return Err(BuildError::MalformedParameter("acknowledgement needs a packet id"));
        }
        let mut packet = Self::with_header(kind, kind.reserved_flags(), packet_id, 2, 2)?;
        packet.data.put_u16(packet_id);
        Ok(packet)
    }

    pub fn pingreq() -> Result<Self, BuildError> {
        Self::with_header(ControlPacketType::PINGREQ, 0, 0, 0, 0)
    }

    pub fn disconnect() -> Result<Self, BuildError> {
        Self::with_header(ControlPacketType::DISCONNECT, 0, 0, 0, 0)
    }

    /// Number of bytes ready to be written starting at `index`.
    ///
    /// For producer-driven packets this refills the payload window when `index` lies
    /// outside of it, so it must be called before [`data`](Self::data).
    pub fn available(&mut self, index: usize) -> usize {
        if index >= self.size {
            return 0;
        }
        let Some(chunked) = self.chunked.as_mut() else {
            return self.size - index;
        };
        if index < chunked.payload_start {
            return chunked.payload_start - index;
        }
        if index < chunked.window_start || index >= chunked.window_start + chunked.window_len {
            chunked.fill(&mut self.data, index, self.size);
        }
        chunked.window_start + chunked.window_len - index
    }

    /// The bytes reported by the last [`available`](Self::available) for `index`.
    pub fn data(&self, index: usize) -> &[u8] {
        match &self.chunked {
            None => self.data.get(index..).unwrap_or(&[]),
            Some(c) if index < c.payload_start => &self.data[index..c.payload_start],
            Some(c) => {
                if index < c.window_start || index >= c.window_start + c.window_len {
                    return &[];
                }
                let offset = c.payload_start + (index - c.window_start);
                &self.data[offset..c.payload_start + c.window_len]
            }
        }
    }

    /// The complete packet, unless its payload is streamed from a producer.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self.chunked {
            None => Some(&self.data),
            Some(_) => None,
        }
    }

    /// Total size on the wire.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn packet_type(&self) -> ControlPacketType {
        self.kind
    }

    /// Marks a PUBLISH as a redelivery. No-op for anything else.
    pub fn set_dup(&mut self) {
        if self.kind == ControlPacketType::PUBLISH && self.packet_id != 0 {
            self.data[0] |= publish_flag::DUP;
        }
    }

    /// Whether the packet can leave the outbox as soon as it is written.
    pub fn removable(&self) -> bool {
        self.packet_id == 0
            || matches!(
                self.kind,
                ControlPacketType::PUBACK | ControlPacketType::PUBCOMP
            )
    }
}
