use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Instant;

use tracing::{debug, trace};

use super::engine::{ConnectionState, MqttEngine, MqttEvent, SharedState};
use super::error::MqttClientResult;
use super::handler::MqttEventHandler;
use super::opts::MqttClientOptions;
use super::transport::Transport;
use crate::mqtt_serde::control_packet::QoS;
use crate::mqtt_serde::packet::PayloadProducer;

/// Registration returned by [`MqttClient::add_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

type Handlers = Vec<(HandlerId, Arc<dyn MqttEventHandler>)>;

struct Inner<T> {
    engine: Mutex<MqttEngine<T>>,
    // held for a whole tick, dispatch included, so events reach listeners in order
    tick: Mutex<()>,
    state: Arc<SharedState>,
    client_id: Arc<str>,
    handlers: RwLock<Handlers>,
    next_handler_id: AtomicU64,
}

/// Thread-safe MQTT client handle.
///
/// Clones share one connection. Every operation takes the engine lock for as long as
/// it touches the outbox and releases it before listeners run, so listeners are free
/// to call back into the client.
///
/// The client only makes progress in [`process`](Self::process). Call it regularly, or
/// hand the client to one of the workers in [`worker`](super::worker).
pub struct MqttClient<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MqttClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> MqttClient<T> {
    pub fn new(options: MqttClientOptions, transport: T) -> Self {
        let engine = MqttEngine::new(options, transport);
        let state = engine.shared_state();
        let client_id: Arc<str> = Arc::from(engine.client_id());
        Self {
            inner: Arc::new(Inner {
                engine: Mutex::new(engine),
                tick: Mutex::new(()),
                state,
                client_id,
                handlers: RwLock::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    fn engine(&self) -> MutexGuard<'_, MqttEngine<T>> {
        self.inner
            .engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` on the engine, then hands whatever events it produced to the
    /// listeners once the lock is released.
    fn with_engine<R>(&self, f: impl FnOnce(&mut MqttEngine<T>) -> R) -> R {
        let (result, events) = {
            let mut engine = self.engine();
            let result = f(&mut engine);
            (result, engine.take_events())
        };
        self.dispatch(events);
        result
    }

    fn dispatch(&self, events: Vec<MqttEvent>) {
        if events.is_empty() {
            return;
        }
        let handlers: Vec<Arc<dyn MqttEventHandler>> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for event in &events {
            for handler in &handlers {
                event.dispatch(handler.as_ref());
            }
        }
    }

    /// Registers a listener. Listeners are called in registration order.
    pub fn add_handler(&self, handler: Arc<dyn MqttEventHandler>) -> HandlerId {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, handler));
        debug!(handler = id.0, "handler added");
        id
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Starts connecting. Returns false unless the client is disconnected.
    pub fn connect(&self) -> bool {
        self.with_engine(|engine| engine.connect())
    }

    /// Disconnects, gracefully or by stopping the transport right away with `force`.
    pub fn disconnect(&self, force: bool) -> bool {
        self.with_engine(|engine| engine.disconnect(force))
    }

    /// Queues a PUBLISH. Returns its packet id, or 0 for QoS 0.
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> MqttClientResult<u16> {
        self.with_engine(|engine| engine.publish(topic, qos, retain, payload))
    }

    /// Queues a PUBLISH whose payload is pulled from `producer` while it is written.
    pub fn publish_with_producer<P>(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        producer: P,
        payload_len: usize,
    ) -> MqttClientResult<u16>
    where
        P: PayloadProducer + 'static,
    {
        self.with_engine(|engine| {
            engine.publish_with_producer(topic, qos, retain, producer, payload_len)
        })
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> MqttClientResult<u16> {
        self.subscribe_many(&[(topic, qos)])
    }

    /// Subscribes to several topics with a single SUBSCRIBE packet.
    pub fn subscribe_many(&self, topics: &[(&str, QoS)]) -> MqttClientResult<u16> {
        self.with_engine(|engine| engine.subscribe(topics))
    }

    pub fn unsubscribe(&self, topic: &str) -> MqttClientResult<u16> {
        self.unsubscribe_many(&[topic])
    }

    pub fn unsubscribe_many(&self, topics: &[&str]) -> MqttClientResult<u16> {
        self.with_engine(|engine| engine.unsubscribe(topics))
    }

    /// See [`MqttEngine::clear_queue`].
    pub fn clear_queue(&self, delete_session_data: bool) {
        self.engine().clear_queue(delete_session_data);
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn queue_size(&self) -> usize {
        self.engine().queue_size()
    }

    /// Read without taking the engine lock.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    pub fn options(&self) -> MqttClientOptions {
        self.engine().options().clone()
    }

    /// Runs one tick of the connection and delivers the resulting events.
    pub fn process(&self) {
        self.process_at(Instant::now());
    }

    /// [`process`](Self::process) against an explicit clock.
    ///
    /// Only one tick runs at a time. A call made while another tick is still
    /// dispatching, from another thread or from inside a listener, returns without
    /// doing anything.
    pub fn process_at(&self, now: Instant) {
        let _tick = match self.inner.tick.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                trace!("tick already running");
                return;
            }
        };
        self.with_engine(|engine| engine.process(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_client::transport::MemoryTransport;

    #[derive(Default)]
    struct Counter {
        connects: AtomicU64,
    }

    impl MqttEventHandler for Counter {
        fn on_connect(&self, _session_present: bool) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn client() -> (MqttClient<MemoryTransport>, MemoryTransport) {
        let broker = MemoryTransport::new();
        let options = MqttClientOptions::builder()
            .client_id("handle")
            .keep_alive(0)
            .build();
        (MqttClient::new(options, broker.clone()), broker)
    }

    #[test]
    fn test_clones_share_state() {
        let (client, _) = client();
        let other = client.clone();
        assert!(client.connect());
        assert!(!other.connect());
        assert_eq!(other.state(), ConnectionState::ConnectingTransport1);
        assert_eq!(other.queue_size(), 1);
        assert_eq!(other.client_id(), "handle");
    }

    #[test]
    fn test_add_and_remove_handler() {
        let (client, broker) = client();
        let counter = Arc::new(Counter::default());
        let first = client.add_handler(counter.clone());
        let second = client.add_handler(counter.clone());
        assert_ne!(first, second);

        client.connect();
        client.process();
        client.process();
        broker.push_inbound(&[0x20, 0x02, 0x00, 0x00]);
        client.process();
        assert!(client.connected());
        assert_eq!(counter.connects.load(Ordering::SeqCst), 2);

        assert!(client.remove_handler(first));
        assert!(!client.remove_handler(first));
        client.disconnect(true);
        client.process();
        client.process();
        client.connect();
        client.process();
        client.process();
        broker.push_inbound(&[0x20, 0x02, 0x00, 0x00]);
        client.process();
        assert_eq!(counter.connects.load(Ordering::SeqCst), 3);
    }
}
