// SPDX-License-Identifier: MPL-2.0

//! Errors and failure reports of the client.
//!
//! Three layers report problems:
//! - [`ErrorKind`] is what listeners receive through `on_error` when a packet could
//!   not be queued.
//! - [`DisconnectReason`] is what listeners receive through `on_disconnect`.
//! - [`MqttClientError`] is the `Err` side of every fallible client call.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

use super::transport::TransportError;
use crate::mqtt_serde::packet::BuildError;
use crate::mqtt_serde::parser::ParseError;

/// Failure categories reported to `on_error` listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The packet buffer could not be allocated.
    OutOfMemory,
    /// Reserved for delivery giving up after repeated retries.
    MaxRetries,
    /// A parameter cannot be represented on the wire (empty client id, topic too long...).
    MalformedParameter,
    MiscError,
}

impl From<BuildError> for ErrorKind {
    fn from(error: BuildError) -> Self {
        match error {
            BuildError::OutOfMemory => ErrorKind::OutOfMemory,
            BuildError::MalformedParameter(_) => ErrorKind::MalformedParameter,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::MaxRetries => "maximum retries exceeded",
            ErrorKind::MalformedParameter => "malformed parameter",
            ErrorKind::MiscError => "miscellaneous error",
        };
        f.write_str(text)
    }
}

/// Why a connection ended, as reported to `on_disconnect`.
///
/// The values between 1 and 5 are the CONNACK return codes of MQTT 3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    UserOk = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    MalformedCredentials = 4,
    NotAuthorized = 5,
    TcpDisconnected = 7,
}

impl DisconnectReason {
    /// Maps a non-zero CONNACK return code. The parser only lets 0..=5 through.
    pub fn from_connack_code(code: u8) -> Self {
        match code {
            0 => DisconnectReason::UserOk,
            1 => DisconnectReason::UnacceptableProtocolVersion,
            2 => DisconnectReason::IdentifierRejected,
            3 => DisconnectReason::ServerUnavailable,
            4 => DisconnectReason::MalformedCredentials,
            5 => DisconnectReason::NotAuthorized,
            _ => DisconnectReason::TcpDisconnected,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DisconnectReason::UserOk => "disconnected by user",
            DisconnectReason::UnacceptableProtocolVersion => "unacceptable protocol version",
            DisconnectReason::IdentifierRejected => "client identifier rejected",
            DisconnectReason::ServerUnavailable => "server unavailable",
            DisconnectReason::MalformedCredentials => "bad username or password",
            DisconnectReason::NotAuthorized => "not authorized",
            DisconnectReason::TcpDisconnected => "transport disconnected",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// One entry of a SUBACK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscribeReturnCode {
    GrantedQoS0,
    GrantedQoS1,
    GrantedQoS2,
    Failure,
}

impl SubscribeReturnCode {
    /// The parser only accepts 0, 1, 2 and 0x80; everything else maps to `Failure`.
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x00 => SubscribeReturnCode::GrantedQoS0,
            0x01 => SubscribeReturnCode::GrantedQoS1,
            0x02 => SubscribeReturnCode::GrantedQoS2,
            _ => SubscribeReturnCode::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        *self != SubscribeReturnCode::Failure
    }
}

/// `Err` side of the client calls.
///
/// Only the enqueuing calls and configuration loading fail synchronously. Trouble on
/// an established connection is reported through listeners instead.
#[derive(Debug, Clone, serde::Serialize)]
pub enum MqttClientError {
    /// The transport went away or refused to connect
    ConnectionLost { reason: String },

    NetworkError {
        #[serde(skip)]
        kind: io::ErrorKind,
        message: String,
    },

    /// `raw_data` holds the input that triggered the error, when known
    PacketParsing {
        parse_error: String,
        raw_data: Vec<u8>,
    },

    /// Every packet identifier is held by a queued packet
    PacketIdExhausted,

    PacketBuild { kind: ErrorKind, message: String },

    /// The call needs a connected client
    NotConnected,

    InvalidConfiguration { field: String, reason: String },
}

impl MqttClientError {
    /// True when the same call may succeed later, after a reconnect or once the outbox drains.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. }
                | Self::NetworkError { .. }
                | Self::NotConnected
                | Self::PacketIdExhausted
                | Self::PacketBuild {
                    kind: ErrorKind::OutOfMemory,
                    ..
                }
        )
    }

    /// True when retrying cannot help without changing the configuration.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidConfiguration { .. })
    }

    /// The category reported to `on_error` listeners for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PacketBuild { kind, .. } => *kind,
            Self::InvalidConfiguration { .. } => ErrorKind::MalformedParameter,
            _ => ErrorKind::MiscError,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectionLost { reason } => {
                format!("Connection to broker lost: {}", reason)
            }
            Self::NetworkError { kind, message } => {
                format!("Network error ({:?}): {}", kind, message)
            }
            Self::PacketParsing {
                parse_error,
                raw_data,
            } => {
                let data_preview = if raw_data.len() > 20 {
                    format!(
                        "{}... ({} bytes)",
                        hex::encode(&raw_data[..20]),
                        raw_data.len()
                    )
                } else {
                    hex::encode(raw_data)
                };
                format!(
                    "Failed to parse MQTT packet: {} (data: {})",
                    parse_error, data_preview
                )
            }
            Self::PacketIdExhausted => {
                "All packet identifiers are in use. Wait for pending operations to complete."
                    .to_string()
            }
            Self::PacketBuild { kind, message } => {
                format!("Could not build packet ({}): {}", kind, message)
            }
            Self::NotConnected => "Not connected to broker. Call connect() first.".to_string(),
            Self::InvalidConfiguration { field, reason } => {
                format!("Invalid configuration for '{}': {}", field, reason)
            }
        }
    }

    /// Keeps the offending bytes so the message can show a hex preview.
    pub fn from_parse_error_with_data(error: ParseError, raw_data: Vec<u8>) -> Self {
        Self::PacketParsing {
            parse_error: error.to_string(),
            raw_data,
        }
    }
}

impl fmt::Display for MqttClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for MqttClientError {}

impl From<io::Error> for MqttClientError {
    fn from(error: io::Error) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<ParseError> for MqttClientError {
    fn from(error: ParseError) -> Self {
        Self::PacketParsing {
            parse_error: error.to_string(),
            raw_data: Vec::new(),
        }
    }
}

impl From<BuildError> for MqttClientError {
    fn from(error: BuildError) -> Self {
        Self::PacketBuild {
            kind: error.into(),
            message: error.to_string(),
        }
    }
}

impl From<TransportError> for MqttClientError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Io(e) => e.into(),
            other => Self::ConnectionLost {
                reason: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for MqttClientError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidConfiguration {
            field: "json".to_string(),
            reason: error.to_string(),
        }
    }
}

/// Result type alias for MQTT client operations
pub type MqttClientResult<T> = Result<T, MqttClientError>;
