pub mod stream;

use std::error::Error;
use std::fmt;

use crate::mqtt_serde::control_packet::{ControlPacketType, QoS};

pub use stream::MqttParser;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    More(usize, String), // not enough data for processing, hint for how many more bytes are needed
    ParseError(String),
    Utf8Error(std::str::Utf8Error),
    BufferTooShort,
    InvalidPacketType,
    InvalidVariableByteInteger,
    InvalidPublishFlags(u8),
    InvalidRemainingLength { header: u8, length: usize },
    InvalidConnAck { session_present: u8, return_code: u8 },
    InvalidSubAckReturnCode(u8),
    InvalidTopicLength { topic_length: usize, max: usize },
    ZeroPacketId,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::More(hint, msg) => write!(f, "More data needed ({} bytes): {}", hint, msg),
            ParseError::ParseError(msg) => write!(f, "Parse Error: {}", msg),
            ParseError::Utf8Error(e) => write!(f, "UTF-8 Error: {}", e),
            ParseError::BufferTooShort => write!(f, "Buffer Too Short"),
            ParseError::InvalidPacketType => write!(f, "Invalid Packet Type"),
            ParseError::InvalidVariableByteInteger => write!(f, "Invalid Variable Byte Integer"),
            ParseError::InvalidPublishFlags(flags) => {
                write!(f, "Invalid PUBLISH flags 0x{:02X}", flags)
            }
            ParseError::InvalidRemainingLength { header, length } => write!(
                f,
                "Invalid remaining length {} for header 0x{:02X}",
                length, header
            ),
            ParseError::InvalidConnAck {
                session_present,
                return_code,
            } => write!(
                f,
                "Invalid CONNACK (session present {}, return code {})",
                session_present, return_code
            ),
            ParseError::InvalidSubAckReturnCode(code) => {
                write!(f, "Invalid SUBACK return code 0x{:02X}", code)
            }
            ParseError::InvalidTopicLength { topic_length, max } => {
                write!(f, "Invalid topic length {} (max {})", topic_length, max)
            }
            ParseError::ZeroPacketId => write!(f, "Packet identifier must not be 0"),
        }
    }
}

impl Error for ParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ParseError::Utf8Error(e) => Some(e),
            _ => None,
        }
    }
}

/// What a call to [`MqttParser::parse`] ended on.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// All input consumed, the current packet is not complete yet.
    AwaitData,
    /// A packet (or, for PUBLISH, a payload chunk) is ready in [`MqttParser::packet`].
    Packet,
    /// The peer violated the protocol; the parser is back at the fixed header.
    ProtocolError(ParseError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixedHeader {
    /// The complete first byte, type and flags.
    pub packet_type: u8,
    pub remaining_length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableHeader {
    pub packet_id: u16,
    pub topic_length: usize,
    pub topic: String,
    pub session_present: bool,
    pub return_code: u8,
}

/// Progress through a PUBLISH payload.
///
/// `index` is the offset of the current chunk in the whole payload, `length` the size
/// of the chunk returned by the last `parse` call and `total` the size of the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadWindow {
    pub index: usize,
    pub length: usize,
    pub total: usize,
}

impl PayloadWindow {
    pub fn is_last_chunk(&self) -> bool {
        self.index + self.length == self.total
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingPacket {
    pub fixed_header: FixedHeader,
    pub variable_header: VariableHeader,
    pub payload: PayloadWindow,
    pub(crate) suback_codes: Vec<u8>,
}

impl IncomingPacket {
    pub fn control_packet_type(&self) -> Option<ControlPacketType> {
        ControlPacketType::from_header_byte(self.fixed_header.packet_type).ok()
    }

    fn is_publish(&self) -> bool {
        self.control_packet_type() == Some(ControlPacketType::PUBLISH)
    }

    pub fn qos(&self) -> QoS {
        if !self.is_publish() {
            return QoS::AtMostOnce;
        }
        QoS::try_from((self.fixed_header.packet_type & 0x06) >> 1).unwrap_or_default()
    }

    pub fn retain(&self) -> bool {
        self.is_publish() && self.fixed_header.packet_type & 0x01 != 0
    }

    pub fn dup(&self) -> bool {
        self.is_publish() && self.fixed_header.packet_type & 0x08 != 0
    }

    pub fn packet_id(&self) -> u16 {
        self.variable_header.packet_id
    }

    /// SUBACK return codes, empty for every other packet type.
    pub fn return_codes(&self) -> &[u8] {
        &self.suback_codes
    }

    pub(crate) fn reset(&mut self) {
        self.fixed_header = FixedHeader::default();
        self.variable_header.packet_id = 0;
        self.variable_header.topic_length = 0;
        self.variable_header.topic.clear();
        self.variable_header.session_present = false;
        self.variable_header.return_code = 0;
        self.payload = PayloadWindow::default();
        self.suback_codes.clear();
    }
}
