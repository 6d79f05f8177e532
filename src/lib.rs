//! Non-blocking MQTT 3.1.1 client core.
//!
//! The crate is split the same way the wire is:
//!
//! - [`mqtt_serde`] turns packets into bytes and bytes into packets. It knows nothing
//!   about connections or time.
//! - [`mqtt_client`] owns a connection: the outbox of packets waiting to be written or
//!   acknowledged, the connection state machine, keep-alive and retry timers, and the
//!   listeners that receive events.
//!
//! Nothing in here blocks. A [`mqtt_client::MqttClient`] is driven by calling
//! [`process`](mqtt_client::MqttClient::process) periodically, either from the
//! application loop or from one of the workers in [`mqtt_client::worker`].
//!
//! ```no_run
//! use mqtt_edge::mqtt_client::{MqttClient, MqttClientOptions, QoS, TcpTransport};
//!
//! let options = MqttClientOptions::builder()
//!     .host("broker.local")
//!     .client_id("sensor-7")
//!     .keep_alive(30)
//!     .build();
//! let client = MqttClient::new(options, TcpTransport::new());
//! client.connect();
//! loop {
//!     client.process();
//!     if client.connected() {
//!         let _ = client.publish("sensors/7/temp", QoS::AtLeastOnce, false, b"21.5");
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```

pub mod mqtt_client;
pub mod mqtt_serde;
