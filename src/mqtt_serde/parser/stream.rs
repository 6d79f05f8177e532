use tracing::{trace, warn};

use super::{IncomingPacket, ParseError, ParseOutcome};
use crate::mqtt_serde::base_data::{Utf8String, VariableByteInteger};
use crate::mqtt_serde::control_packet::ControlPacketType;

/// Room for SUBACK return codes when nothing else is configured.
pub const DEFAULT_PAYLOAD_BUFFER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FixedHeader,
    RemainingLengthFixed,
    RemainingLengthVariable,
    RemainingLengthNone,
    ConnAckFlags,
    ConnAckReturnCode,
    PacketIdHigh,
    PacketIdLow,
    TopicLengthHigh,
    TopicLengthLow,
    Topic,
    SubAckPayload,
    PublishPayload,
}

/// Incremental parser for the packets a broker sends to a client.
///
/// Input can be split anywhere: every call to [`parse`](Self::parse) consumes bytes
/// until a packet completes, the input runs out or the peer breaks the protocol. The
/// parser never buffers PUBLISH payloads. Each call that ends inside a payload returns
/// [`ParseOutcome::Packet`] and describes the chunk in [`IncomingPacket::payload`];
/// the chunk itself is the last `payload.length` bytes of the consumed input.
///
/// Only client-bound packets are accepted (CONNACK, PUBLISH, PUBACK, PUBREC, PUBREL,
/// PUBCOMP, SUBACK, UNSUBACK, PINGRESP). Anything else is a protocol error.
#[derive(Debug)]
pub struct MqttParser {
    state: State,
    packet: IncomingPacket,
    length_bytes: [u8; 4],
    length_pos: usize,
    topic_bytes: Vec<u8>,
    payload_buffer_size: usize,
}

impl Default for MqttParser {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD_BUFFER_SIZE)
    }
}

impl MqttParser {
    /// `payload_buffer_size` bounds the SUBACK payload (one return code per topic).
    pub fn new(payload_buffer_size: usize) -> Self {
        Self {
            state: State::FixedHeader,
            packet: IncomingPacket::default(),
            length_bytes: [0; 4],
            length_pos: 0,
            topic_bytes: Vec::new(),
            payload_buffer_size,
        }
    }

    /// Drops any partial packet. Called whenever a new transport connection starts.
    pub fn reset(&mut self) {
        self.state = State::FixedHeader;
        self.length_pos = 0;
        self.topic_bytes.clear();
        self.packet.reset();
    }

    /// The packet described by the last [`ParseOutcome::Packet`].
    pub fn packet(&self) -> &IncomingPacket {
        &self.packet
    }

    /// Feeds `data` to the parser. Returns the outcome and the number of bytes consumed.
    pub fn parse(&mut self, data: &[u8]) -> (ParseOutcome, usize) {
        let mut consumed = 0;
        while consumed < data.len() {
            if self.state == State::PublishPayload {
                let length = self.publish_payload(data.len() - consumed);
                consumed += length;
                return (ParseOutcome::Packet, consumed);
            }
            let byte = data[consumed];
            consumed += 1;
            match self.step(byte) {
                ParseOutcome::AwaitData => {}
                ParseOutcome::ProtocolError(e) => {
                    warn!(error = %e, "protocol error");
                    self.state = State::FixedHeader;
                    return (ParseOutcome::ProtocolError(e), consumed);
                }
                outcome => return (outcome, consumed),
            }
        }
        (ParseOutcome::AwaitData, consumed)
    }

    fn step(&mut self, byte: u8) -> ParseOutcome {
        let result = match self.state {
            State::FixedHeader => self.fixed_header(byte),
            State::RemainingLengthFixed => self.remaining_length_fixed(byte),
            State::RemainingLengthVariable => self.remaining_length_variable(byte),
            State::RemainingLengthNone => self.remaining_length_none(byte),
            State::ConnAckFlags => self.connack_flags(byte),
            State::ConnAckReturnCode => self.connack_return_code(byte),
            State::PacketIdHigh => {
                self.packet.variable_header.packet_id = u16::from(byte) << 8;
                self.state = State::PacketIdLow;
                Ok(ParseOutcome::AwaitData)
            }
            State::PacketIdLow => self.packet_id_low(byte),
            State::TopicLengthHigh => {
                self.packet.variable_header.topic_length = usize::from(byte) << 8;
                self.state = State::TopicLengthLow;
                Ok(ParseOutcome::AwaitData)
            }
            State::TopicLengthLow => self.topic_length_low(byte),
            State::Topic => self.topic(byte),
            State::SubAckPayload => self.suback_payload(byte),
            // handled in `parse` without going byte by byte
            State::PublishPayload => Ok(ParseOutcome::AwaitData),
        };
        result.unwrap_or_else(ParseOutcome::ProtocolError)
    }

    fn packet_type(&self) -> Option<ControlPacketType> {
        self.packet.control_packet_type()
    }

    fn has_packet_id(&self) -> bool {
        self.packet.fixed_header.packet_type & 0x06 != 0
    }

    fn complete(&mut self) -> Result<ParseOutcome, ParseError> {
        trace!(header = self.packet.fixed_header.packet_type, "packet complete");
        self.state = State::FixedHeader;
        Ok(ParseOutcome::Packet)
    }

    fn fixed_header(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        self.packet.reset();
        self.topic_bytes.clear();
        self.length_pos = 0;
        self.packet.fixed_header.packet_type = byte;

        if byte & 0xF0 == ControlPacketType::PUBLISH.header_bits() {
            let flags = byte & 0x0F;
            // dup without QoS and QoS 3 are not allowed
            if !matches!(flags, 0x00..=0x05 | 0x0A..=0x0D) {
                return Err(ParseError::InvalidPublishFlags(flags));
            }
            self.state = State::RemainingLengthVariable;
            return Ok(ParseOutcome::AwaitData);
        }

        self.state = match byte {
            0x20 | 0x40 | 0x50 | 0x62 | 0x70 | 0xB0 => State::RemainingLengthFixed,
            0x90 => State::RemainingLengthVariable,
            0xD0 => State::RemainingLengthNone,
            _ => return Err(ParseError::InvalidPacketType),
        };
        Ok(ParseOutcome::AwaitData)
    }

    fn remaining_length_fixed(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        self.packet.fixed_header.remaining_length = usize::from(byte);
        if byte != 2 {
            return Err(ParseError::InvalidRemainingLength {
                header: self.packet.fixed_header.packet_type,
                length: usize::from(byte),
            });
        }
        self.state = if self.packet_type() == Some(ControlPacketType::CONNACK) {
            State::ConnAckFlags
        } else {
            State::PacketIdHigh
        };
        Ok(ParseOutcome::AwaitData)
    }

    fn remaining_length_variable(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        self.length_bytes[self.length_pos] = byte;
        self.length_pos += 1;
        if byte & 0x80 != 0 {
            if self.length_pos == self.length_bytes.len() {
                return Err(ParseError::InvalidVariableByteInteger);
            }
            return Ok(ParseOutcome::AwaitData);
        }

        let (length, _) = VariableByteInteger::decode(&self.length_bytes[..self.length_pos])?;
        self.packet.fixed_header.remaining_length = length;
        let invalid = ParseError::InvalidRemainingLength {
            header: self.packet.fixed_header.packet_type,
            length,
        };

        if self.packet_type() == Some(ControlPacketType::PUBLISH) {
            let minimum = if self.has_packet_id() { 4 } else { 2 };
            if length < minimum {
                return Err(invalid);
            }
            self.state = State::TopicLengthHigh;
        } else {
            // SUBACK: packet id followed by at least one return code
            let payload_size = length.saturating_sub(2);
            if payload_size == 0 || payload_size > self.payload_buffer_size {
                return Err(invalid);
            }
            self.packet.payload.total = payload_size;
            self.packet.payload.length = payload_size;
            self.state = State::PacketIdHigh;
        }
        trace!(remaining_length = length, "remaining length");
        Ok(ParseOutcome::AwaitData)
    }

    fn remaining_length_none(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        self.packet.fixed_header.remaining_length = usize::from(byte);
        if byte != 0 {
            return Err(ParseError::InvalidRemainingLength {
                header: self.packet.fixed_header.packet_type,
                length: usize::from(byte),
            });
        }
        self.complete()
    }

    fn connack_flags(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        if byte > 1 {
            return Err(ParseError::InvalidConnAck {
                session_present: byte,
                return_code: 0,
            });
        }
        self.packet.variable_header.session_present = byte == 1;
        self.state = State::ConnAckReturnCode;
        Ok(ParseOutcome::AwaitData)
    }

    fn connack_return_code(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        if byte > 5 {
            return Err(ParseError::InvalidConnAck {
                session_present: u8::from(self.packet.variable_header.session_present),
                return_code: byte,
            });
        }
        self.packet.variable_header.return_code = byte;
        self.complete()
    }

    fn packet_id_low(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        self.packet.variable_header.packet_id |= u16::from(byte);
        if self.packet.variable_header.packet_id == 0 {
            return Err(ParseError::ZeroPacketId);
        }
        match self.packet_type() {
            Some(ControlPacketType::SUBACK) => {
                self.state = State::SubAckPayload;
                Ok(ParseOutcome::AwaitData)
            }
            Some(ControlPacketType::PUBLISH) => {
                self.packet.payload.total -= 2;
                self.publish_header_done()
            }
            _ => self.complete(),
        }
    }

    fn topic_length_low(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        let header = &mut self.packet.variable_header;
        header.topic_length |= usize::from(byte);
        let remaining = self.packet.fixed_header.remaining_length;
        let max = remaining - 2 - if self.has_packet_id() { 2 } else { 0 };
        let topic_length = self.packet.variable_header.topic_length;
        if topic_length == 0 || topic_length > max {
            return Err(ParseError::InvalidTopicLength { topic_length, max });
        }
        self.packet.payload.total = remaining - 2 - topic_length;
        self.topic_bytes.reserve(topic_length);
        self.state = State::Topic;
        Ok(ParseOutcome::AwaitData)
    }

    fn topic(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        self.topic_bytes.push(byte);
        if self.topic_bytes.len() < self.packet.variable_header.topic_length {
            return Ok(ParseOutcome::AwaitData);
        }
        self.packet.variable_header.topic = Utf8String::decode(&self.topic_bytes)?;
        if self.has_packet_id() {
            self.state = State::PacketIdHigh;
            return Ok(ParseOutcome::AwaitData);
        }
        self.publish_header_done()
    }

    fn publish_header_done(&mut self) -> Result<ParseOutcome, ParseError> {
        if self.packet.payload.total == 0 {
            return self.complete();
        }
        self.state = State::PublishPayload;
        Ok(ParseOutcome::AwaitData)
    }

    fn suback_payload(&mut self, byte: u8) -> Result<ParseOutcome, ParseError> {
        if !(byte < 0x03 || byte == 0x80) {
            return Err(ParseError::InvalidSubAckReturnCode(byte));
        }
        self.packet.suback_codes.push(byte);
        if self.packet.suback_codes.len() == self.packet.payload.total {
            return self.complete();
        }
        Ok(ParseOutcome::AwaitData)
    }

    /// Takes the next payload chunk out of `available` input bytes.
    fn publish_payload(&mut self, available: usize) -> usize {
        let payload = &mut self.packet.payload;
        payload.index += payload.length;
        payload.length = available.min(payload.total - payload.index);
        trace!(
            index = payload.index,
            length = payload.length,
            total = payload.total,
            "publish payload chunk"
        );
        if payload.is_last_chunk() {
            self.state = State::FixedHeader;
        }
        payload.length
    }
}
