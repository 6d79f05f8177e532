use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use super::error::{
    DisconnectReason, ErrorKind, MqttClientError, MqttClientResult, SubscribeReturnCode,
};
use super::opts::{generate_client_id, MqttClientOptions};
use super::outbox::{EntryId, Outbox, OutboxEntry, Retention};
use super::transport::Transport;
use crate::mqtt_serde::control_packet::{ControlPacketType, QoS};
use crate::mqtt_serde::packet::{BuildError, ConnectParams, Packet, PayloadProducer, Will};
use crate::mqtt_serde::parser::{MqttParser, ParseOutcome};

/// Connection states, in the order a connection goes through them.
///
/// The ordering is meaningful: everything above [`Connected`](Self::Connected) is some
/// stage of tearing the connection down.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Disconnected = 0,
    /// `connect()` was called, the transport has not been asked yet
    ConnectingTransport1 = 1,
    /// Waiting for the transport to report a connection
    ConnectingTransport2 = 2,
    /// CONNECT queued, waiting for CONNACK
    ConnectingProtocol = 3,
    Connected = 4,
    /// Graceful disconnect requested, waiting for the outbox to drain
    DisconnectingProtocol1 = 5,
    /// DISCONNECT queued
    DisconnectingProtocol2 = 6,
    /// Transport must be stopped
    DisconnectingTransport1 = 7,
    /// Waiting for the transport to go away
    DisconnectingTransport2 = 8,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::ConnectingTransport1,
            2 => ConnectionState::ConnectingTransport2,
            3 => ConnectionState::ConnectingProtocol,
            4 => ConnectionState::Connected,
            5 => ConnectionState::DisconnectingProtocol1,
            6 => ConnectionState::DisconnectingProtocol2,
            7 => ConnectionState::DisconnectingTransport1,
            8 => ConnectionState::DisconnectingTransport2,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Connection state readable without taking the engine lock.
#[derive(Debug)]
pub struct SharedState(AtomicU8);

impl SharedState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Flags of a received PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageProperties {
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    pub packet_id: u16,
}

/// One chunk of a received PUBLISH payload.
///
/// Large payloads arrive in several chunks; `index` is the offset of this chunk in the
/// whole payload and `total` the size of the whole payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub properties: MessageProperties,
    pub topic: String,
    pub payload: Bytes,
    pub index: usize,
    pub total: usize,
}

/// Something the application should hear about, produced while the engine lock was held.
///
/// [`MqttClient`](super::MqttClient) turns each of these into one listener call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Connected {
        session_present: bool,
    },
    Disconnected(DisconnectReason),
    Subscribed {
        packet_id: u16,
        return_codes: Vec<SubscribeReturnCode>,
    },
    Unsubscribed {
        packet_id: u16,
    },
    MessageReceived(IncomingMessage),
    /// QoS 1 PUBACK or QoS 2 PUBCOMP received
    Published {
        packet_id: u16,
    },
    /// A packet could not be queued. `packet_id` is 0 for CONNECT.
    Error {
        packet_id: u16,
        kind: ErrorKind,
    },
}

/// Single-owner MQTT 3.1.1 protocol engine.
///
/// The engine owns the transport, the outbox and the parser, and moves a connection
/// through [`ConnectionState`] each time [`process`](Self::process) is called. It never
/// blocks: every call does what the transport allows right now and returns.
///
/// Operations never call back into the application. Whatever happened is collected
/// as [`MqttEvent`]s and stays queued until [`take_events`](Self::take_events) drains
/// it, so a caller that owns the engine directly should drain after every `process`.
pub struct MqttEngine<T> {
    options: MqttClientOptions,
    client_id: String,
    transport: T,
    state: Arc<SharedState>,
    outbox: Outbox,
    // bytes of the current outbox entry already handed to the transport
    bytes_sent: usize,
    parser: MqttParser,
    rx_buffer: Vec<u8>,
    last_packet_id: u16,
    // time of the last `process` call, used to stamp new outbox entries
    clock: Instant,
    last_client_activity: Instant,
    last_server_activity: Instant,
    ping_sent: bool,
    disconnect_reason: DisconnectReason,
    events: Vec<MqttEvent>,
}

impl<T: Transport> MqttEngine<T> {
    pub fn new(options: MqttClientOptions, transport: T) -> Self {
        let client_id = options
            .client_id
            .clone()
            .unwrap_or_else(generate_client_id);
        let now = Instant::now();
        Self {
            parser: MqttParser::new(options.payload_buffer_size),
            rx_buffer: vec![0; options.rx_buffer_size.max(1)],
            options,
            client_id,
            transport,
            state: Arc::new(SharedState::new(ConnectionState::Disconnected)),
            outbox: Outbox::new(),
            bytes_sent: 0,
            last_packet_id: 0,
            clock: now,
            last_client_activity: now,
            last_server_activity: now,
            ping_sent: false,
            disconnect_reason: DisconnectReason::UserOk,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Handle to the state cell, for readers that do not hold the engine.
    pub fn shared_state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn options(&self) -> &MqttClientOptions {
        &self.options
    }

    /// Number of packets waiting to be written or acknowledged.
    pub fn queue_size(&self) -> usize {
        self.outbox.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drains the events collected since the last call.
    pub fn take_events(&mut self) -> Vec<MqttEvent> {
        std::mem::take(&mut self.events)
    }

    /// Queues CONNECT in front of everything else and starts connecting.
    ///
    /// Returns false unless the engine is disconnected. A CONNECT that cannot be
    /// built is reported as an `Error` event with packet id 0.
    pub fn connect(&mut self) -> bool {
        if self.state() != ConnectionState::Disconnected {
            return false;
        }
        let will = self.options.will.as_ref().map(|will| Will {
            topic: &will.topic,
            payload: &will.payload,
            qos: will.qos,
            retain: will.retain,
        });
        let params = ConnectParams {
            client_id: &self.client_id,
            clean_session: self.options.clean_session,
            keep_alive: self.options.keep_alive,
            username: self.options.username.as_deref(),
            password: self.options.password.as_deref(),
            will,
        };
        match Packet::connect(&params) {
            Ok(packet) => {
                self.outbox.push_front(packet, self.clock);
                self.set_state(ConnectionState::ConnectingTransport1);
                true
            }
            Err(e) => {
                error!(error = %e, "could not create CONNECT packet");
                self.push_error(0, e);
                false
            }
        }
    }

    /// Starts a disconnect.
    ///
    /// A graceful disconnect (`force == false`) is only possible while connected: the
    /// outbox is drained first, then DISCONNECT is sent. A forced disconnect stops the
    /// transport right away from any state that is not already stopping it.
    pub fn disconnect(&mut self, force: bool) -> bool {
        let state = self.state();
        if force {
            if matches!(
                state,
                ConnectionState::Disconnected
                    | ConnectionState::DisconnectingTransport1
                    | ConnectionState::DisconnectingTransport2
            ) {
                return false;
            }
            self.disconnect_reason = DisconnectReason::UserOk;
            self.set_state(ConnectionState::DisconnectingTransport1);
            return true;
        }
        if state == ConnectionState::Connected {
            self.disconnect_reason = DisconnectReason::UserOk;
            self.set_state(ConnectionState::DisconnectingProtocol1);
            return true;
        }
        false
    }

    /// Queues a PUBLISH and returns its packet id, 0 for QoS 0.
    pub fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> MqttClientResult<u16> {
        self.check_publish_allowed()?;
        let packet_id = self.publish_packet_id(qos)?;
        let packet = Packet::publish(packet_id, topic, qos, retain, payload);
        self.enqueue(packet_id, packet)?;
        Ok(packet_id)
    }

    /// Queues a PUBLISH whose `payload_len` bytes are pulled from `producer` while the
    /// packet is written, so the payload never has to be in memory at once.
    pub fn publish_with_producer<P>(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        producer: P,
        payload_len: usize,
    ) -> MqttClientResult<u16>
    where
        P: PayloadProducer + 'static,
    {
        self.check_publish_allowed()?;
        let packet_id = self.publish_packet_id(qos)?;
        let packet = Packet::publish_chunked(
            packet_id,
            topic,
            qos,
            retain,
            Box::new(producer),
            payload_len,
            self.options.tx_chunk_size,
        );
        self.enqueue(packet_id, packet)?;
        Ok(packet_id)
    }

    pub fn subscribe(&mut self, topics: &[(&str, QoS)]) -> MqttClientResult<u16> {
        self.check_connected()?;
        let packet_id = self.next_packet_id()?;
        let packet = Packet::subscribe(packet_id, topics);
        self.enqueue(packet_id, packet)?;
        Ok(packet_id)
    }

    pub fn unsubscribe(&mut self, topics: &[&str]) -> MqttClientResult<u16> {
        self.check_connected()?;
        let packet_id = self.next_packet_id()?;
        let packet = Packet::unsubscribe(packet_id, topics);
        self.enqueue(packet_id, packet)?;
        Ok(packet_id)
    }

    /// Empties the outbox.
    ///
    /// With `delete_session_data` false, QoS 1/2 PUBLISH, PUBREC and PUBREL survive so
    /// the session can resume. A packet that is half written is finished first.
    pub fn clear_queue(&mut self, delete_session_data: bool) {
        let retention = if delete_session_data {
            Retention::DiscardAll
        } else {
            Retention::KeepSession
        };
        let in_flight = if self.bytes_sent > 0 {
            self.outbox.current_id()
        } else {
            None
        };
        self.outbox.flush(retention, in_flight);
    }

    /// Runs one tick of the connection state machine.
    pub fn process(&mut self, now: Instant) {
        self.clock = now;
        let mut state = self.state();

        if state == ConnectionState::ConnectingTransport1 {
            match self.transport.connect(&self.options.host, self.options.port) {
                Ok(()) => {
                    self.set_state(ConnectionState::ConnectingTransport2);
                    state = ConnectionState::ConnectingTransport2;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        host = %self.options.host,
                        port = self.options.port,
                        "transport connect failed"
                    );
                    self.disconnect_with(DisconnectReason::TcpDisconnected);
                    return;
                }
            }
        }

        match state {
            ConnectionState::ConnectingTransport2 => {
                if self.transport.connected() {
                    self.parser.reset();
                    self.last_client_activity = now;
                    self.last_server_activity = now;
                    self.set_state(ConnectionState::ConnectingProtocol);
                } else if self.transport.disconnected() {
                    self.disconnect_with(DisconnectReason::TcpDisconnected);
                }
            }
            ConnectionState::ConnectingProtocol if self.options.wait_for_connack => {
                if !self.transport.connected() {
                    self.disconnect_with(DisconnectReason::TcpDisconnected);
                    return;
                }
                self.send_packet(now);
                self.check_incoming(now);
                if self.state() < ConnectionState::DisconnectingTransport1 {
                    self.check_ping(now);
                }
            }
            ConnectionState::ConnectingProtocol
            | ConnectionState::Connected
            | ConnectionState::DisconnectingProtocol2 => self.run_connected(now),
            ConnectionState::DisconnectingProtocol1 => {
                if self.outbox.is_empty() {
                    match Packet::disconnect() {
                        Ok(packet) => {
                            self.outbox.push_back(packet, now);
                            self.set_state(ConnectionState::DisconnectingProtocol2);
                        }
                        Err(e) => error!(error = %e, "could not create DISCONNECT packet"),
                    }
                }
                self.run_connected(now);
            }
            ConnectionState::DisconnectingTransport1 => {
                self.transport.stop();
                self.set_state(ConnectionState::DisconnectingTransport2);
            }
            ConnectionState::DisconnectingTransport2 => {
                if self.transport.disconnected() {
                    self.outbox.flush(Retention::KeepSession, None);
                    self.bytes_sent = 0;
                    self.set_state(ConnectionState::Disconnected);
                    info!(reason = %self.disconnect_reason, "disconnected");
                    self.events
                        .push(MqttEvent::Disconnected(self.disconnect_reason));
                }
            }
            ConnectionState::Disconnected | ConnectionState::ConnectingTransport1 => {}
        }
    }

    fn run_connected(&mut self, now: Instant) {
        if !self.transport.connected() {
            self.disconnect_with(DisconnectReason::TcpDisconnected);
            return;
        }
        self.check_outbox(now);
        if self.stopping() {
            return;
        }
        self.check_incoming(now);
        if self.stopping() {
            return;
        }
        self.check_ping(now);
        if self.stopping() {
            return;
        }
        self.check_timeout(now);
    }

    fn stopping(&self) -> bool {
        self.state() >= ConnectionState::DisconnectingTransport1
    }

    fn set_state(&mut self, state: ConnectionState) {
        let from = self.state.load();
        debug!(from = ?from, to = ?state, "state change");
        self.state.store(state);
    }

    fn disconnect_with(&mut self, reason: DisconnectReason) {
        self.disconnect_reason = reason;
        self.set_state(ConnectionState::DisconnectingTransport1);
    }

    fn push_error(&mut self, packet_id: u16, error: BuildError) {
        self.events.push(MqttEvent::Error {
            packet_id,
            kind: error.into(),
        });
    }

    fn check_connected(&self) -> MqttClientResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(MqttClientError::NotConnected);
        }
        Ok(())
    }

    fn check_publish_allowed(&self) -> MqttClientResult<()> {
        let state = self.state();
        let allowed = if self.options.allow_publish_before_connected {
            state <= ConnectionState::Connected
        } else {
            state == ConnectionState::Connected
        };
        if !allowed {
            return Err(MqttClientError::NotConnected);
        }
        Ok(())
    }

    fn publish_packet_id(&mut self, qos: QoS) -> MqttClientResult<u16> {
        match qos {
            QoS::AtMostOnce => Ok(0),
            _ => self.next_packet_id(),
        }
    }

    /// Next free packet id. Ids wrap around, skip 0, and skip ids still held by a
    /// queued PUBLISH, SUBSCRIBE, UNSUBSCRIBE or PUBREL.
    fn next_packet_id(&mut self) -> MqttClientResult<u16> {
        for _ in 0..u16::MAX {
            self.last_packet_id = self.last_packet_id.wrapping_add(1);
            if self.last_packet_id == 0 {
                self.last_packet_id = 1;
            }
            let candidate = self.last_packet_id;
            let in_use = self
                .outbox
                .find(|entry| {
                    entry.packet.packet_id() == candidate
                        && matches!(
                            entry.packet.packet_type(),
                            ControlPacketType::PUBLISH
                                | ControlPacketType::SUBSCRIBE
                                | ControlPacketType::UNSUBSCRIBE
                                | ControlPacketType::PUBREL
                        )
                })
                .is_some();
            if !in_use {
                return Ok(candidate);
            }
        }
        warn!("no free packet id");
        self.events.push(MqttEvent::Error {
            packet_id: 0,
            kind: ErrorKind::MaxRetries,
        });
        Err(MqttClientError::PacketIdExhausted)
    }

    fn enqueue(
        &mut self,
        packet_id: u16,
        packet: Result<Packet, BuildError>,
    ) -> MqttClientResult<EntryId> {
        match packet {
            Ok(packet) => {
                trace!(packet_id, kind = %packet.packet_type(), size = packet.size(), "queued");
                Ok(self.outbox.push_back(packet, self.clock))
            }
            Err(e) => {
                error!(packet_id, error = %e, "could not create packet");
                self.push_error(packet_id, e);
                Err(e.into())
            }
        }
    }

    fn enqueue_ack(&mut self, kind: ControlPacketType, packet_id: u16) {
        // failures are already reported as events
        let _ = self.enqueue(packet_id, Packet::ack(kind, packet_id));
    }

    /// Writes as much of the current outbox entry as the transport takes.
    fn send_packet(&mut self, now: Instant) -> usize {
        let bytes_sent = self.bytes_sent;
        let Some(entry) = self.outbox.current_mut() else {
            return 0;
        };
        let wanted = entry.packet.available(bytes_sent);
        if wanted == 0 {
            return 0;
        }
        let data = entry.packet.data(bytes_sent);
        let written = self.transport.write(&data[..wanted.min(data.len())]);
        if written > 0 {
            entry.time_sent = now;
            self.last_client_activity = now;
            self.bytes_sent += written;
            trace!(written, bytes_sent = self.bytes_sent, size = entry.packet.size(), "written");
        }
        written
    }

    /// Moves past the current entry once it is completely written. Returns whether
    /// there is anything left to write.
    fn advance_outbox(&mut self) -> bool {
        let bytes_sent = self.bytes_sent;
        let Some(entry) = self.outbox.current_mut() else {
            return false;
        };
        if bytes_sent != entry.packet.size() {
            return true;
        }
        let kind = entry.packet.packet_type();
        debug!(kind = %kind, packet_id = entry.packet.packet_id(), "sent");
        if entry.packet.removable() || entry.acknowledged {
            self.outbox.remove_current();
        } else {
            entry.packet.set_dup();
            self.outbox.advance();
        }
        self.bytes_sent = 0;
        if kind == ControlPacketType::DISCONNECT {
            self.disconnect_with(DisconnectReason::UserOk);
        }
        self.outbox.current().is_some()
    }

    fn check_outbox(&mut self, now: Instant) {
        while self.send_packet(now) > 0 {
            if !self.advance_outbox() {
                break;
            }
        }
    }

    fn check_incoming(&mut self, now: Instant) {
        let mut rx = std::mem::take(&mut self.rx_buffer);
        let received = self.transport.read(&mut rx);
        if received > 0 {
            self.last_server_activity = now;
            trace!(received, "read");
            let mut offset = 0;
            while offset < received {
                let input = &rx[offset..received];
                let (outcome, consumed) = self.parser.parse(input);
                match outcome {
                    ParseOutcome::Packet => {
                        // SUBACK codes are buffered by the parser, only PUBLISH
                        // payloads point into the input
                        let packet = self.parser.packet();
                        let is_publish =
                            packet.control_packet_type() == Some(ControlPacketType::PUBLISH);
                        let chunk = if is_publish {
                            &input[consumed - packet.payload.length..consumed]
                        } else {
                            &input[..0]
                        };
                        if !self.handle_packet(chunk) {
                            break;
                        }
                    }
                    ParseOutcome::ProtocolError(e) => {
                        let preview = input[..consumed].to_vec();
                        let error = MqttClientError::from_parse_error_with_data(e, preview);
                        warn!(error = %error, "closing connection");
                        self.disconnect_with(DisconnectReason::TcpDisconnected);
                        break;
                    }
                    ParseOutcome::AwaitData => {}
                }
                if consumed == 0 {
                    break;
                }
                offset += consumed;
            }
        }
        self.rx_buffer = rx;
    }

    /// Reacts to the packet the parser just completed. Returns false when the rest
    /// of the input must be dropped.
    fn handle_packet(&mut self, chunk: &[u8]) -> bool {
        let packet = self.parser.packet();
        let Some(kind) = packet.control_packet_type() else {
            return true;
        };
        let packet_id = packet.packet_id();
        debug!(kind = %kind, packet_id, "received");

        if self.state() == ConnectionState::ConnectingProtocol
            && self.options.wait_for_connack
            && kind != ControlPacketType::CONNACK
        {
            warn!(kind = %kind, "expected CONNACK");
            self.disconnect_with(DisconnectReason::TcpDisconnected);
            return false;
        }

        match kind {
            ControlPacketType::CONNACK => return self.on_connack(),
            ControlPacketType::PUBLISH => {
                if self.state() < ConnectionState::DisconnectingProtocol1 {
                    self.on_publish(chunk);
                }
            }
            ControlPacketType::PUBACK => {
                if self.retire_first_pending(ControlPacketType::PUBLISH, packet_id, "PUBACK") {
                    self.events.push(MqttEvent::Published { packet_id });
                }
            }
            ControlPacketType::PUBREC => {
                let publish = self.first_pending(ControlPacketType::PUBLISH, packet_id, "PUBREC");
                if let Some(id) = publish {
                    self.enqueue_ack(ControlPacketType::PUBREL, packet_id);
                    self.retire(id);
                }
            }
            ControlPacketType::PUBREL => {
                let pubrec = self.first_pending(ControlPacketType::PUBREC, packet_id, "PUBREL");
                if let Some(id) = pubrec {
                    self.enqueue_ack(ControlPacketType::PUBCOMP, packet_id);
                    self.retire(id);
                }
            }
            ControlPacketType::PUBCOMP => {
                if self.retire_first_pending(ControlPacketType::PUBREL, packet_id, "PUBCOMP") {
                    self.events.push(MqttEvent::Published { packet_id });
                }
            }
            ControlPacketType::SUBACK => {
                if self.retire_matching(ControlPacketType::SUBSCRIBE, packet_id) {
                    let return_codes = self
                        .parser
                        .packet()
                        .return_codes()
                        .iter()
                        .map(|code| SubscribeReturnCode::from_u8(*code))
                        .collect();
                    self.events.push(MqttEvent::Subscribed {
                        packet_id,
                        return_codes,
                    });
                }
            }
            ControlPacketType::UNSUBACK => {
                if self.retire_matching(ControlPacketType::UNSUBSCRIBE, packet_id) {
                    self.events.push(MqttEvent::Unsubscribed { packet_id });
                }
            }
            ControlPacketType::PINGRESP => {
                trace!("PINGRESP");
                self.ping_sent = false;
            }
            // the parser rejects everything a broker must not send
            _ => {}
        }
        true
    }

    fn on_connack(&mut self) -> bool {
        let header = &self.parser.packet().variable_header;
        let session_present = header.session_present;
        let return_code = header.return_code;
        if return_code != 0 {
            let reason = DisconnectReason::from_connack_code(return_code);
            warn!(return_code, reason = %reason, "connection refused");
            self.disconnect_with(reason);
            return false;
        }
        self.ping_sent = false;
        self.set_state(ConnectionState::Connected);
        self.advance_outbox();
        if !session_present {
            let in_flight = if self.bytes_sent > 0 {
                self.outbox.current_id()
            } else {
                None
            };
            self.outbox.flush(Retention::KeepPublish, in_flight);
        }
        info!(session_present, client_id = %self.client_id, "connected");
        self.events.push(MqttEvent::Connected { session_present });
        true
    }

    fn on_publish(&mut self, chunk: &[u8]) {
        let packet = self.parser.packet();
        let properties = MessageProperties {
            qos: packet.qos(),
            dup: packet.dup(),
            retain: packet.retain(),
            packet_id: packet.packet_id(),
        };
        let window = packet.payload;
        let last_chunk = window.is_last_chunk();
        let topic = packet.variable_header.topic.clone();
        let packet_id = properties.packet_id;

        let mut deliver = true;
        match properties.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                if last_chunk {
                    self.enqueue_ack(ControlPacketType::PUBACK, packet_id);
                }
            }
            QoS::ExactlyOnce => {
                let seen = self
                    .outbox
                    .find(|entry| {
                        entry.packet.packet_type() == ControlPacketType::PUBREC
                            && entry.packet.packet_id() == packet_id
                    })
                    .is_some();
                if seen {
                    debug!(packet_id, "duplicate QoS 2 PUBLISH");
                    deliver = false;
                }
                if last_chunk {
                    self.enqueue_ack(ControlPacketType::PUBREC, packet_id);
                }
            }
        }
        if deliver {
            self.events.push(MqttEvent::MessageReceived(IncomingMessage {
                properties,
                topic,
                payload: Bytes::copy_from_slice(chunk),
                index: window.index,
                total: window.total,
            }));
        }
    }

    /// The first pending entry of type `kind`, if it carries `packet_id`.
    ///
    /// Acknowledgements of this kind arrive in the order the packets were sent, so only
    /// the first candidate is considered.
    fn first_pending(
        &self,
        kind: ControlPacketType,
        packet_id: u16,
        ack: &str,
    ) -> Option<EntryId> {
        let (id, entry) = self
            .outbox
            .iter()
            .find(|(_, entry)| entry.is_pending(kind))?;
        if entry.packet.packet_id() != packet_id {
            warn!(
                ack,
                packet_id,
                expected = entry.packet.packet_id(),
                "out of order acknowledgement"
            );
            return None;
        }
        Some(id)
    }

    fn retire_first_pending(
        &mut self,
        kind: ControlPacketType,
        packet_id: u16,
        ack: &str,
    ) -> bool {
        match self.first_pending(kind, packet_id, ack) {
            Some(id) => {
                self.retire(id);
                true
            }
            None => false,
        }
    }

    fn find_pending(&self, kind: ControlPacketType, packet_id: u16) -> Option<EntryId> {
        self.outbox.find(|entry: &OutboxEntry| {
            entry.is_pending(kind) && entry.packet.packet_id() == packet_id
        })
    }

    fn retire_matching(&mut self, kind: ControlPacketType, packet_id: u16) -> bool {
        match self.find_pending(kind, packet_id) {
            Some(id) => {
                self.retire(id);
                true
            }
            None => false,
        }
    }

    /// Removes an acknowledged entry. A half-written entry stays until its last byte
    /// is out so the stream is not corrupted.
    fn retire(&mut self, id: EntryId) {
        if self.bytes_sent > 0 && self.outbox.current_id() == Some(id) {
            if let Some(entry) = self.outbox.get_mut(id) {
                entry.acknowledged = true;
            }
            return;
        }
        self.outbox.remove(id);
    }

    fn check_ping(&mut self, now: Instant) {
        if self.options.keep_alive == 0 {
            return;
        }
        let keep_alive = self.options.keep_alive_interval();
        let server_silence = now.saturating_duration_since(self.last_server_activity);
        let client_silence = now.saturating_duration_since(self.last_client_activity);

        if server_silence > keep_alive * 2 {
            warn!(?server_silence, "broker stopped responding");
            self.disconnect_with(DisconnectReason::TcpDisconnected);
            return;
        }
        if !self.ping_sent && (client_silence > keep_alive || server_silence > keep_alive) {
            match Packet::pingreq() {
                Ok(packet) => {
                    trace!("PINGREQ queued");
                    self.outbox.push_back(packet, now);
                    self.ping_sent = true;
                }
                Err(e) => error!(error = %e, "could not create PINGREQ packet"),
            }
        }
    }

    /// Starts writing the whole outbox again when the oldest written packet has
    /// waited too long for its acknowledgement.
    fn check_timeout(&mut self, now: Instant) {
        if self.bytes_sent != 0 {
            return;
        }
        let Some(front) = self.outbox.front() else {
            return;
        };
        if self.outbox.current_id() == Some(front) {
            return;
        }
        let Some(entry) = self.outbox.get(front) else {
            return;
        };
        let waited = now.saturating_duration_since(entry.time_sent);
        if waited > self.options.ack_timeout() {
            warn!(
                kind = %entry.packet.packet_type(),
                packet_id = entry.packet.packet_id(),
                ?waited,
                "acknowledgement timeout, resending"
            );
            self.outbox.reset_current();
        }
    }
}
