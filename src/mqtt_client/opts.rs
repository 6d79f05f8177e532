use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{MqttClientError, MqttClientResult};
use super::transport::Host;
use crate::mqtt_serde::control_packet::QoS;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEP_ALIVE: u16 = 15;
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RX_BUFFER_SIZE: usize = 1440;
pub const DEFAULT_TX_CHUNK_SIZE: usize = crate::mqtt_serde::packet::DEFAULT_CHUNK_SIZE;
pub const DEFAULT_PAYLOAD_BUFFER_SIZE: usize =
    crate::mqtt_serde::parser::stream::DEFAULT_PAYLOAD_BUFFER_SIZE;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Message the broker publishes on our behalf when the connection dies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttClientOptions {
    pub host: Host,
    pub port: u16,
    /// `None` picks a random `mqtt-edge-xxxxxxxx` id when the client is created.
    pub client_id: Option<String>,
    pub clean_session: bool,
    /// Seconds. 0 disables keep-alive.
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<LastWill>,
    // --------------------------
    // Extended options
    // --------------------------
    // how long the head of the outbox may wait for its acknowledgement before the
    // whole outbox is written again
    pub ack_timeout_ms: u64,
    // bytes read from the transport per tick
    pub rx_buffer_size: usize,
    // producer-driven PUBLISH payloads are kept in memory in windows of this size
    pub tx_chunk_size: usize,
    // upper bound for the return codes of one SUBACK
    pub payload_buffer_size: usize,
    // if false, packets other than CONNACK are accepted before the CONNACK arrives
    pub wait_for_connack: bool,
    // if true, publish() queues packets while the connection is still being set up
    pub allow_publish_before_connected: bool,
    // sleep between two ticks of the background workers
    pub poll_interval_ms: u64,
}

impl Default for MqttClientOptions {
    fn default() -> Self {
        Self {
            host: Host::default(),
            port: DEFAULT_PORT,
            client_id: None,
            clean_session: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
            username: None,
            password: None,
            will: None,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            tx_chunk_size: DEFAULT_TX_CHUNK_SIZE,
            payload_buffer_size: DEFAULT_PAYLOAD_BUFFER_SIZE,
            wait_for_connack: true,
            allow_publish_before_connected: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl MqttClientOptions {
    pub fn builder() -> MqttClientOptionsBuilder {
        MqttClientOptionsBuilder::new()
    }

    /// Loads options from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> MqttClientResult<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_json(&self) -> MqttClientResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> MqttClientResult<()> {
        let invalid = |field: &str, reason: &str| MqttClientError::InvalidConfiguration {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        if self.port == 0 {
            return Err(invalid("port", "must not be 0"));
        }
        if matches!(&self.client_id, Some(id) if id.is_empty()) {
            return Err(invalid("client_id", "must not be empty"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(invalid("password", "requires a username"));
        }
        if self.rx_buffer_size == 0 {
            return Err(invalid("rx_buffer_size", "must not be 0"));
        }
        if self.tx_chunk_size == 0 {
            return Err(invalid("tx_chunk_size", "must not be 0"));
        }
        if self.payload_buffer_size == 0 {
            return Err(invalid("payload_buffer_size", "must not be 0"));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Random client id, used when none is configured.
pub fn generate_client_id() -> String {
    format!("mqtt-edge-{:08x}", rand::random::<u32>())
}

#[derive(Debug, Clone, Default)]
pub struct MqttClientOptionsBuilder {
    options: MqttClientOptions,
}

impl MqttClientOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<Host>) -> Self {
        self.options.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.options.client_id = Some(client_id.into());
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.options.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.options.keep_alive = seconds;
        self
    }

    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.options.username = Some(username.into());
        self.options.password = Some(password.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.options.username = Some(username.into());
        self
    }

    pub fn will(mut self, will: LastWill) -> Self {
        self.options.will = Some(will);
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.options.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn rx_buffer_size(mut self, size: usize) -> Self {
        self.options.rx_buffer_size = size;
        self
    }

    pub fn tx_chunk_size(mut self, size: usize) -> Self {
        self.options.tx_chunk_size = size;
        self
    }

    pub fn payload_buffer_size(mut self, size: usize) -> Self {
        self.options.payload_buffer_size = size;
        self
    }

    pub fn wait_for_connack(mut self, wait: bool) -> Self {
        self.options.wait_for_connack = wait;
        self
    }

    pub fn allow_publish_before_connected(mut self, allow: bool) -> Self {
        self.options.allow_publish_before_connected = allow;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.options.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn build(self) -> MqttClientOptions {
        self.options
    }
}
