use mqtt_edge::mqtt_client::engine::{ConnectionState, IncomingMessage, MqttEngine, MqttEvent};
use mqtt_edge::mqtt_client::error::{DisconnectReason, ErrorKind, SubscribeReturnCode};
use mqtt_edge::mqtt_client::opts::{LastWill, MqttClientOptions, MqttClientOptionsBuilder};
use mqtt_edge::mqtt_client::transport::MemoryTransport;
use mqtt_edge::mqtt_client::MqttClientError;
use mqtt_edge::mqtt_serde::control_packet::QoS;
use std::time::{Duration, Instant};

const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options() -> MqttClientOptionsBuilder {
    MqttClientOptions::builder().client_id("dev1").keep_alive(0)
}

fn setup_engine(options: MqttClientOptions) -> (MqttEngine<MemoryTransport>, MemoryTransport) {
    init_tracing();
    let broker = MemoryTransport::new();
    (MqttEngine::new(options, broker.clone()), broker)
}

/// Connects and swallows the CONNECT bytes and the Connected event.
fn bring_up(engine: &mut MqttEngine<MemoryTransport>, broker: &MemoryTransport, now: Instant) {
    assert!(engine.connect());
    engine.process(now);
    engine.process(now);
    broker.push_inbound(&CONNACK);
    engine.process(now);
    assert_eq!(engine.state(), ConnectionState::Connected);
    broker.take_outbound();
    engine.take_events();
}

/// Runs the remaining ticks of a disconnect.
fn wind_down(engine: &mut MqttEngine<MemoryTransport>, now: Instant) {
    for _ in 0..3 {
        engine.process(now);
    }
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

fn messages(events: &[MqttEvent]) -> Vec<&IncomingMessage> {
    events
        .iter()
        .filter_map(|event| match event {
            MqttEvent::MessageReceived(message) => Some(message),
            _ => None,
        })
        .collect()
}

#[test]
fn test_connect_publish_disconnect() {
    let (mut engine, broker) = setup_engine(options().keep_alive(60).build());
    let now = Instant::now();

    assert!(engine.connect());
    engine.process(now);
    assert_eq!(engine.state(), ConnectionState::ConnectingProtocol);
    engine.process(now);
    assert_eq!(
        broker.take_outbound(),
        vec![
            0x10, 0x10, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04,
            b'd', b'e', b'v', b'1'
        ]
    );

    broker.push_inbound(&CONNACK);
    engine.process(now);
    assert_eq!(engine.state(), ConnectionState::Connected);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Connected {
            session_present: false
        }]
    );
    assert_eq!(engine.queue_size(), 0);

    let packet_id = engine.publish("a/b", QoS::AtLeastOnce, false, b"hi").unwrap();
    assert_eq!(packet_id, 1);
    assert_eq!(engine.queue_size(), 1);
    engine.process(now);
    assert_eq!(
        broker.take_outbound(),
        vec![0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x01, b'h', b'i']
    );
    // written, still waiting for PUBACK
    assert_eq!(engine.queue_size(), 1);

    broker.push_inbound(&[0x40, 0x02, 0x00, 0x01]);
    engine.process(now);
    assert_eq!(engine.queue_size(), 0);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Published { packet_id: 1 }]
    );

    assert!(engine.disconnect(false));
    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0xE0, 0x00]);
    wind_down(&mut engine, now);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Disconnected(DisconnectReason::UserOk)]
    );
}

#[test]
fn test_malformed_connack_forces_disconnect() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    engine.connect();
    engine.process(now);
    engine.process(now);
    broker.push_inbound(&[0x20, 0x03, 0x00, 0x00]);
    engine.process(now);
    assert_eq!(engine.state(), ConnectionState::DisconnectingTransport1);
    wind_down(&mut engine, now);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Disconnected(DisconnectReason::TcpDisconnected)]
    );
    assert_eq!(broker.stop_calls(), 1);
}

#[test]
fn test_packet_before_connack_is_protocol_error() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    engine.connect();
    engine.process(now);
    engine.process(now);
    broker.push_inbound(&[0xD0, 0x00]);
    engine.process(now);
    assert_eq!(engine.state(), ConnectionState::DisconnectingTransport1);
}

#[test]
fn test_connack_refusal_maps_reason() {
    let cases = [
        (0x01, DisconnectReason::UnacceptableProtocolVersion),
        (0x02, DisconnectReason::IdentifierRejected),
        (0x03, DisconnectReason::ServerUnavailable),
        (0x04, DisconnectReason::MalformedCredentials),
        (0x05, DisconnectReason::NotAuthorized),
    ];
    for (code, reason) in cases {
        let (mut engine, broker) = setup_engine(options().build());
        let now = Instant::now();
        engine.connect();
        engine.process(now);
        engine.process(now);
        broker.push_inbound(&[0x20, 0x02, 0x00, code]);
        engine.process(now);
        wind_down(&mut engine, now);
        assert_eq!(engine.take_events(), vec![MqttEvent::Disconnected(reason)]);
    }
}

#[test]
fn test_qos2_duplicate_publish_suppressed() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    let publish = [0x34, 0x06, 0x00, 0x01, b't', 0x00, 0x05, b'x'];
    broker.push_inbound(&publish);
    broker.push_inbound(&publish);
    engine.process(now);
    let events = engine.take_events();
    let received = messages(&events);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic, "t");
    assert_eq!(received[0].properties.qos, QoS::ExactlyOnce);
    assert_eq!(received[0].properties.packet_id, 5);
    assert_eq!(&received[0].payload[..], b"x");

    // the handshake still runs for both copies
    engine.process(now);
    assert_eq!(
        broker.take_outbound(),
        vec![0x50, 0x02, 0x00, 0x05, 0x50, 0x02, 0x00, 0x05]
    );
    assert_eq!(engine.queue_size(), 2);

    broker.push_inbound(&[0x62, 0x02, 0x00, 0x05]);
    engine.process(now);
    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0x70, 0x02, 0x00, 0x05]);
    assert_eq!(engine.queue_size(), 1);
}

#[test]
fn test_qos1_incoming_publish_is_acknowledged() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    broker.push_inbound(&[0x33, 0x06, 0x00, 0x01, b't', 0x00, 0x07, b'v']);
    engine.process(now);
    let events = engine.take_events();
    let received = messages(&events);
    assert_eq!(received.len(), 1);
    assert!(received[0].properties.retain);
    assert_eq!(received[0].total, 1);

    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0x40, 0x02, 0x00, 0x07]);
    // PUBACK leaves the outbox once written
    assert_eq!(engine.queue_size(), 0);
}

#[test]
fn test_large_publish_delivered_in_chunks() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    let mut publish = vec![0x32, 0x0F, 0x00, 0x01, b't', 0x00, 0x07];
    publish.extend_from_slice(b"0123456789");
    broker.push_inbound(&publish);
    broker.set_read_limit(Some(4));

    let mut chunks = Vec::new();
    for _ in 0..5 {
        engine.process(now);
        for event in engine.take_events() {
            if let MqttEvent::MessageReceived(message) = event {
                chunks.push((message.index, message.payload.to_vec(), message.total));
            }
        }
        // acknowledged only after the last chunk
        assert!(broker.take_outbound().is_empty());
    }
    assert_eq!(
        chunks,
        vec![
            (0, b"0".to_vec(), 10),
            (1, b"1234".to_vec(), 10),
            (5, b"5678".to_vec(), 10),
            (9, b"9".to_vec(), 10),
        ]
    );
    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0x40, 0x02, 0x00, 0x07]);
}

#[test]
fn test_keep_alive_ping_and_dead_connection() {
    let (mut engine, broker) = setup_engine(options().keep_alive(10).build());
    let start = Instant::now();
    bring_up(&mut engine, &broker, start);

    engine.process(start + Duration::from_secs(9));
    assert!(broker.take_outbound().is_empty());

    // PINGREQ is queued on this tick and written on the next
    engine.process(start + Duration::from_secs(11));
    engine.process(start + Duration::from_secs(12));
    assert_eq!(broker.take_outbound(), vec![0xC0, 0x00]);

    for secs in 13..=20 {
        engine.process(start + Duration::from_secs(secs));
    }
    assert!(broker.take_outbound().is_empty());
    assert_eq!(engine.state(), ConnectionState::Connected);

    engine.process(start + Duration::from_secs(21));
    assert_eq!(engine.state(), ConnectionState::DisconnectingTransport1);
    wind_down(&mut engine, start + Duration::from_secs(21));
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Disconnected(DisconnectReason::TcpDisconnected)]
    );
}

#[test]
fn test_pingresp_keeps_connection_alive() {
    let (mut engine, broker) = setup_engine(options().keep_alive(10).build());
    let start = Instant::now();
    bring_up(&mut engine, &broker, start);

    engine.process(start + Duration::from_secs(11));
    engine.process(start + Duration::from_secs(11));
    assert_eq!(broker.take_outbound(), vec![0xC0, 0x00]);
    broker.push_inbound(&[0xD0, 0x00]);
    engine.process(start + Duration::from_secs(12));

    engine.process(start + Duration::from_secs(21));
    assert_eq!(engine.state(), ConnectionState::Connected);
    // silence since the PINGRESP triggers the next ping
    engine.process(start + Duration::from_secs(23));
    engine.process(start + Duration::from_secs(23));
    assert_eq!(broker.take_outbound(), vec![0xC0, 0x00]);
}

#[test]
fn test_double_graceful_disconnect() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    assert!(engine.disconnect(false));
    assert!(!engine.disconnect(false));
    wind_down(&mut engine, now);
    assert_eq!(broker.take_outbound(), vec![0xE0, 0x00]);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Disconnected(DisconnectReason::UserOk)]
    );
    assert!(!engine.disconnect(false));
}

#[test]
fn test_graceful_disconnect_waits_for_outbox() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    engine.publish("a/b", QoS::AtLeastOnce, false, b"hi").unwrap();
    assert!(engine.disconnect(false));
    engine.process(now);
    engine.process(now);
    assert_eq!(engine.state(), ConnectionState::DisconnectingProtocol1);
    let sent = broker.take_outbound();
    assert_eq!(sent[0], 0x32);
    assert!(!sent.ends_with(&[0xE0, 0x00]));

    // incoming messages are ignored once the disconnect started
    broker.push_inbound(&[0x30, 0x04, 0x00, 0x01, b't', b'x']);
    broker.push_inbound(&[0x40, 0x02, 0x00, 0x01]);
    engine.process(now);
    assert_eq!(engine.state(), ConnectionState::DisconnectingProtocol1);
    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0xE0, 0x00]);
    wind_down(&mut engine, now);

    let events = engine.take_events();
    assert!(messages(&events).is_empty());
    assert_eq!(
        events,
        vec![
            MqttEvent::Published { packet_id: 1 },
            MqttEvent::Disconnected(DisconnectReason::UserOk)
        ]
    );
}

#[test]
fn test_ack_timeout_resends_with_dup() {
    let (mut engine, broker) = setup_engine(
        options()
            .ack_timeout(Duration::from_secs(1))
            .build(),
    );
    let start = Instant::now();
    bring_up(&mut engine, &broker, start);

    engine.publish("a/b", QoS::AtLeastOnce, false, b"hi").unwrap();
    engine.process(start);
    assert_eq!(broker.take_outbound()[0], 0x32);

    engine.process(start + Duration::from_millis(900));
    assert!(broker.take_outbound().is_empty());

    engine.process(start + Duration::from_secs(2));
    engine.process(start + Duration::from_secs(2));
    assert_eq!(
        broker.take_outbound(),
        vec![0x3A, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x01, b'h', b'i']
    );

    broker.push_inbound(&[0x40, 0x02, 0x00, 0x01]);
    engine.process(start + Duration::from_secs(2));
    assert_eq!(engine.queue_size(), 0);
}

#[test]
fn test_packet_ids_increase() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    assert_eq!(engine.publish("t", QoS::AtLeastOnce, false, b"1").unwrap(), 1);
    assert_eq!(engine.publish("t", QoS::ExactlyOnce, false, b"2").unwrap(), 2);
    assert_eq!(engine.publish("t", QoS::AtMostOnce, false, b"3").unwrap(), 0);
    assert_eq!(engine.subscribe(&[("t", QoS::AtMostOnce)]).unwrap(), 3);
    engine.process(now);
    broker.push_inbound(&[0x40, 0x02, 0x00, 0x01]);
    engine.process(now);
    // freed ids are not handed out again right away
    assert_eq!(engine.unsubscribe(&["t"]).unwrap(), 4);
}

#[test]
fn test_qos0_publish_leaves_outbox_once_written() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    assert_eq!(engine.publish("t", QoS::AtMostOnce, false, b"x").unwrap(), 0);
    assert_eq!(engine.queue_size(), 1);
    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0x30, 0x04, 0x00, 0x01, b't', b'x']);
    assert_eq!(engine.queue_size(), 0);
    assert!(engine.take_events().is_empty());
}

#[test]
fn test_subscribe_and_unsubscribe() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    let packet_id = engine
        .subscribe(&[("a/#", QoS::AtLeastOnce), ("b", QoS::ExactlyOnce)])
        .unwrap();
    assert_eq!(packet_id, 1);
    engine.process(now);
    assert_eq!(
        broker.take_outbound(),
        vec![
            0x82, 0x0C, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'#', 0x01, 0x00, 0x01, b'b', 0x02
        ]
    );
    broker.push_inbound(&[0x90, 0x04, 0x00, 0x01, 0x01, 0x80]);
    engine.process(now);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Subscribed {
            packet_id: 1,
            return_codes: vec![SubscribeReturnCode::GrantedQoS1, SubscribeReturnCode::Failure],
        }]
    );

    assert_eq!(engine.unsubscribe(&["a/#"]).unwrap(), 2);
    engine.process(now);
    assert_eq!(
        broker.take_outbound(),
        vec![0xA2, 0x07, 0x00, 0x02, 0x00, 0x03, b'a', b'/', b'#']
    );
    // an UNSUBACK for an unknown id is ignored
    broker.push_inbound(&[0xB0, 0x02, 0x00, 0x09]);
    broker.push_inbound(&[0xB0, 0x02, 0x00, 0x02]);
    engine.process(now);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Unsubscribed { packet_id: 2 }]
    );
    assert_eq!(engine.queue_size(), 0);
}

#[test]
fn test_out_of_order_puback_is_ignored() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    engine.publish("t", QoS::AtLeastOnce, false, b"1").unwrap();
    engine.publish("t", QoS::AtLeastOnce, false, b"2").unwrap();
    engine.process(now);
    broker.push_inbound(&[0x40, 0x02, 0x00, 0x02]);
    engine.process(now);
    assert!(engine.take_events().is_empty());
    assert_eq!(engine.queue_size(), 2);
    assert_eq!(engine.state(), ConnectionState::Connected);
}

#[test]
fn test_out_of_order_pubrel_is_ignored() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    broker.push_inbound(&[0x34, 0x06, 0x00, 0x01, b't', 0x00, 0x05, b'x']);
    broker.push_inbound(&[0x34, 0x06, 0x00, 0x01, b't', 0x00, 0x06, b'y']);
    engine.process(now);
    engine.process(now);
    assert_eq!(
        broker.take_outbound(),
        vec![0x50, 0x02, 0x00, 0x05, 0x50, 0x02, 0x00, 0x06]
    );
    engine.take_events();

    // only the first PUBREC may be released
    broker.push_inbound(&[0x62, 0x02, 0x00, 0x06]);
    engine.process(now);
    engine.process(now);
    assert!(broker.take_outbound().is_empty());
    assert_eq!(engine.queue_size(), 2);
    assert_eq!(engine.state(), ConnectionState::Connected);

    broker.push_inbound(&[0x62, 0x02, 0x00, 0x05]);
    engine.process(now);
    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0x70, 0x02, 0x00, 0x05]);
    assert_eq!(engine.queue_size(), 1);

    broker.push_inbound(&[0x62, 0x02, 0x00, 0x06]);
    engine.process(now);
    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0x70, 0x02, 0x00, 0x06]);
    assert_eq!(engine.queue_size(), 0);
    assert!(engine.take_events().is_empty());
}

#[test]
fn test_qos2_outgoing_handshake() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    assert_eq!(engine.publish("t", QoS::ExactlyOnce, false, b"x").unwrap(), 1);
    engine.process(now);
    assert_eq!(broker.take_outbound()[0], 0x34);

    broker.push_inbound(&[0x50, 0x02, 0x00, 0x01]);
    engine.process(now);
    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0x62, 0x02, 0x00, 0x01]);
    assert!(engine.take_events().is_empty());
    assert_eq!(engine.queue_size(), 1);

    broker.push_inbound(&[0x70, 0x02, 0x00, 0x01]);
    engine.process(now);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Published { packet_id: 1 }]
    );
    assert_eq!(engine.queue_size(), 0);
}

#[test]
fn test_session_resumes_after_transport_loss() {
    let (mut engine, broker) = setup_engine(options().clean_session(false).build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    engine.publish("a/b", QoS::AtLeastOnce, false, b"hi").unwrap();
    engine.publish("a/b", QoS::AtMostOnce, false, b"lo").unwrap();
    engine.process(now);
    broker.take_outbound();

    broker.drop_connection();
    engine.process(now);
    assert_eq!(engine.state(), ConnectionState::DisconnectingTransport1);
    wind_down(&mut engine, now);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Disconnected(DisconnectReason::TcpDisconnected)]
    );
    // the unacknowledged QoS 1 PUBLISH is kept
    assert_eq!(engine.queue_size(), 1);

    assert!(engine.connect());
    engine.process(now);
    engine.process(now);
    let connect = broker.take_outbound();
    assert_eq!(connect[0], 0x10);
    // clean session flag cleared
    assert_eq!(connect[9], 0x00);

    broker.push_inbound(&[0x20, 0x02, 0x01, 0x00]);
    engine.process(now);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Connected {
            session_present: true
        }]
    );
    engine.process(now);
    assert_eq!(
        broker.take_outbound(),
        vec![0x3A, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x01, b'h', b'i']
    );
}

#[test]
fn test_clear_queue() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    engine.publish("t", QoS::AtLeastOnce, false, b"1").unwrap();
    engine.publish("t", QoS::AtMostOnce, false, b"2").unwrap();
    engine.subscribe(&[("t", QoS::AtMostOnce)]).unwrap();
    assert_eq!(engine.queue_size(), 3);

    engine.clear_queue(false);
    assert_eq!(engine.queue_size(), 1);
    engine.clear_queue(true);
    assert_eq!(engine.queue_size(), 0);
}

#[test]
fn test_clear_queue_finishes_half_written_packet() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    engine.publish("a/b", QoS::AtLeastOnce, false, b"hi").unwrap();
    broker.set_write_budget(Some(4));
    engine.process(now);
    engine.process(now);
    assert_eq!(broker.take_outbound().len(), 4);

    engine.clear_queue(true);
    assert_eq!(engine.queue_size(), 1);
    broker.set_write_budget(None);
    engine.process(now);
    assert_eq!(broker.take_outbound().len(), 7);
    assert_eq!(engine.queue_size(), 0);
}

#[test]
fn test_full_transport_holds_packets() {
    let (mut engine, broker) = setup_engine(options().build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    broker.set_write_limit(Some(0));
    engine.publish("t", QoS::AtMostOnce, false, b"x").unwrap();
    engine.process(now);
    assert!(broker.take_outbound().is_empty());
    assert_eq!(engine.queue_size(), 1);

    broker.set_write_limit(Some(1));
    engine.process(now);
    assert_eq!(broker.take_outbound(), vec![0x30, 0x04, 0x00, 0x01, b't', b'x']);
    assert_eq!(engine.queue_size(), 0);
}

#[test]
fn test_publish_with_producer() {
    let (mut engine, broker) = setup_engine(options().tx_chunk_size(4).build());
    let now = Instant::now();
    bring_up(&mut engine, &broker, now);

    let data: Vec<u8> = (0u8..10).collect();
    let source = data.clone();
    let producer = move |offset: usize, buf: &mut [u8]| -> usize {
        let rest = &source[offset..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        n
    };
    let packet_id = engine
        .publish_with_producer("t", QoS::AtLeastOnce, false, producer, data.len())
        .unwrap();
    assert_eq!(packet_id, 1);

    broker.set_write_limit(Some(3));
    engine.process(now);
    let mut expected = vec![0x32, 0x0F, 0x00, 0x01, b't', 0x00, 0x01];
    expected.extend_from_slice(&data);
    assert_eq!(broker.take_outbound(), expected);
}

#[test]
fn test_publish_with_producer_rewinds_on_resend() {
    let (mut engine, broker) = setup_engine(
        options()
            .tx_chunk_size(4)
            .ack_timeout(Duration::from_secs(1))
            .build(),
    );
    let start = Instant::now();
    bring_up(&mut engine, &broker, start);

    let producer = |offset: usize, buf: &mut [u8]| -> usize {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = b'a' + ((offset + i) % 26) as u8;
        }
        buf.len()
    };
    engine
        .publish_with_producer("t", QoS::AtLeastOnce, false, producer, 6)
        .unwrap();
    engine.process(start);
    let first = broker.take_outbound();
    assert!(first.ends_with(b"abcdef"));

    engine.process(start + Duration::from_secs(2));
    engine.process(start + Duration::from_secs(2));
    let second = broker.take_outbound();
    assert_eq!(second[0], 0x3A);
    assert_eq!(&second[1..], &first[1..]);
}

#[test]
fn test_publish_rejected_when_not_connected() {
    let (mut engine, _broker) = setup_engine(options().build());
    assert!(matches!(
        engine.publish("t", QoS::AtMostOnce, false, b"x"),
        Err(MqttClientError::NotConnected)
    ));
    assert!(matches!(
        engine.unsubscribe(&["t"]),
        Err(MqttClientError::NotConnected)
    ));
}

#[test]
fn test_invalid_client_id_reports_error() {
    let (mut engine, _broker) = setup_engine(options().client_id("").build());
    assert!(!engine.connect());
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Error {
            packet_id: 0,
            kind: ErrorKind::MalformedParameter
        }]
    );
}

#[test]
fn test_connect_carries_will_and_credentials() {
    let (mut engine, broker) = setup_engine(
        options()
            .client_id("c")
            .keep_alive(0)
            .credentials("u", "p")
            .will(LastWill::new("w", "gone", QoS::AtLeastOnce, true))
            .build(),
    );
    let now = Instant::now();
    engine.connect();
    engine.process(now);
    engine.process(now);
    assert_eq!(
        broker.take_outbound(),
        vec![
            0x10, 0x1C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0xEE, 0x00, 0x00, 0x00, 0x01,
            b'c', 0x00, 0x01, b'w', 0x00, 0x04, b'g', b'o', b'n', b'e', 0x00, 0x01, b'u', 0x00,
            0x01, b'p'
        ]
    );
}

#[test]
fn test_send_before_connack_mode() {
    let (mut engine, broker) = setup_engine(
        options()
            .wait_for_connack(false)
            .allow_publish_before_connected(true)
            .build(),
    );
    let now = Instant::now();
    assert_eq!(engine.publish("t", QoS::AtMostOnce, false, b"x").unwrap(), 0);
    engine.connect();
    engine.process(now);
    engine.process(now);
    let sent = broker.take_outbound();
    assert_eq!(sent[0], 0x10);
    assert!(sent.ends_with(&[0x30, 0x04, 0x00, 0x01, b't', b'x']));

    broker.push_inbound(&CONNACK);
    engine.process(now);
    assert_eq!(engine.state(), ConnectionState::Connected);
    assert_eq!(engine.queue_size(), 0);
}

#[test]
fn test_transport_connect_failure() {
    let (mut engine, broker) = setup_engine(options().port(1884).build());
    broker.refuse_connections(true);
    let now = Instant::now();
    engine.connect();
    wind_down(&mut engine, now);
    assert_eq!(broker.connect_calls(), 1);
    assert_eq!(broker.last_target().map(|(_, port)| port), Some(1884));
    assert_eq!(
        engine.take_events(),
        vec![MqttEvent::Disconnected(DisconnectReason::TcpDisconnected)]
    );
}
