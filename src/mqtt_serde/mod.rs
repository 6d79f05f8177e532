// SPDX-License-Identifier: MPL-2.0

pub mod base_data;
pub mod control_packet;
pub mod packet;
pub mod parser;

//re export
pub use crate::mqtt_serde::control_packet::{ControlPacketType, QoS};
pub use crate::mqtt_serde::packet::{Packet, PayloadProducer};
pub use crate::mqtt_serde::parser::{IncomingPacket, MqttParser, ParseError, ParseOutcome};

// MQTT 3.1.1: 3.1.2.1 and 3.1.2.2
pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 4;

/// Flags of the CONNECT variable header.
pub mod connect_flag {
    pub const CLEAN_SESSION: u8 = 0x02;
    pub const WILL: u8 = 0x04;
    pub const WILL_QOS1: u8 = 0x08;
    pub const WILL_QOS2: u8 = 0x10;
    pub const WILL_RETAIN: u8 = 0x20;
    pub const PASSWORD: u8 = 0x40;
    pub const USERNAME: u8 = 0x80;
}

/// Flags in the low nibble of a PUBLISH fixed header.
pub mod publish_flag {
    pub const RETAIN: u8 = 0x01;
    pub const QOS1: u8 = 0x02;
    pub const QOS2: u8 = 0x04;
    pub const DUP: u8 = 0x08;
}
