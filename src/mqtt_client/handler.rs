use super::engine::{MessageProperties, MqttEvent};
use super::error::{DisconnectReason, ErrorKind, SubscribeReturnCode};

/// Listener for client events.
///
/// Every method has a no-op default, so implementors only override what they care
/// about. Methods are called without any client lock held: a listener may call
/// `publish`, `subscribe` or `unsubscribe` on the client it is registered with.
pub trait MqttEventHandler: Send + Sync {
    /// Called when the broker accepted the connection
    fn on_connect(&self, session_present: bool) {
        let _ = session_present;
    }

    /// Called once the transport is gone, whatever the cause
    fn on_disconnect(&self, reason: DisconnectReason) {
        let _ = reason;
    }

    /// Called when a SUBACK arrives, with one return code per requested topic
    fn on_subscribe(&self, packet_id: u16, return_codes: &[SubscribeReturnCode]) {
        let _ = (packet_id, return_codes);
    }

    fn on_unsubscribe(&self, packet_id: u16) {
        let _ = packet_id;
    }

    /// Called for every chunk of an incoming PUBLISH payload.
    ///
    /// `index` is the offset of `payload` in the message and `total` the size of the
    /// whole message. Small messages arrive in one call with `index == 0` and
    /// `payload.len() == total`.
    fn on_message(
        &self,
        properties: &MessageProperties,
        topic: &str,
        payload: &[u8],
        index: usize,
        total: usize,
    ) {
        let _ = (properties, topic, payload, index, total);
    }

    /// Called when a QoS 1 or QoS 2 publish completed its handshake
    fn on_publish(&self, packet_id: u16) {
        let _ = packet_id;
    }

    /// Called when a packet could not be queued
    fn on_error(&self, packet_id: u16, kind: ErrorKind) {
        let _ = (packet_id, kind);
    }
}

impl MqttEvent {
    /// Calls the matching method of `handler`.
    pub fn dispatch(&self, handler: &dyn MqttEventHandler) {
        match self {
            MqttEvent::Connected { session_present } => handler.on_connect(*session_present),
            MqttEvent::Disconnected(reason) => handler.on_disconnect(*reason),
            MqttEvent::Subscribed {
                packet_id,
                return_codes,
            } => handler.on_subscribe(*packet_id, return_codes),
            MqttEvent::Unsubscribed { packet_id } => handler.on_unsubscribe(*packet_id),
            MqttEvent::MessageReceived(message) => handler.on_message(
                &message.properties,
                &message.topic,
                &message.payload,
                message.index,
                message.total,
            ),
            MqttEvent::Published { packet_id } => handler.on_publish(*packet_id),
            MqttEvent::Error { packet_id, kind } => handler.on_error(*packet_id, *kind),
        }
    }
}
