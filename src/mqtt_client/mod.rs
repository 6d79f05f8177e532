pub mod client;
pub mod engine;
pub mod error;
pub mod handler;
pub mod opts;
pub mod outbox;
pub mod transport;
pub mod worker;

pub use client::{HandlerId, MqttClient};
pub use engine::{
    ConnectionState, IncomingMessage, MessageProperties, MqttEngine, MqttEvent, SharedState,
};
pub use error::{
    DisconnectReason, ErrorKind, MqttClientError, MqttClientResult, SubscribeReturnCode,
};
pub use handler::MqttEventHandler;
pub use opts::{LastWill, MqttClientOptions, MqttClientOptionsBuilder};
pub use transport::{Host, MemoryTransport, TcpTransport, Transport, TransportError};
#[cfg(feature = "tokio-worker")]
pub use worker::spawn_tokio_worker;
pub use worker::WorkerHandle;

pub use crate::mqtt_serde::control_packet::QoS;
