//! In-memory transport for tests and simulations.
//!
//! Cloning a [`MemoryTransport`] yields another handle to the same connection, so a
//! test keeps one handle to play the broker while the client owns the other.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Host, Transport, TransportError};

#[derive(Debug)]
struct MemoryState {
    accept_connections: bool,
    connected: bool,
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    write_limit: Option<usize>,
    write_budget: Option<usize>,
    read_limit: Option<usize>,
    connect_calls: usize,
    stop_calls: usize,
    last_target: Option<(Host, u16)>,
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                accept_connections: true,
                connected: false,
                inbound: VecDeque::new(),
                outbound: Vec::new(),
                write_limit: None,
                write_budget: None,
                read_limit: None,
                connect_calls: 0,
                stop_calls: 0,
                last_target: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().accept_connections = !refuse;
    }

    /// Queues bytes for the client to read, as if the broker had sent them.
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes.iter().copied());
    }

    /// Everything the client wrote since the last call.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().outbound)
    }

    /// Caps how many bytes a single `write` accepts. `Some(0)` simulates a full socket.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.lock().write_limit = limit;
    }

    /// Caps how many bytes all following writes accept together, until reset.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.lock().write_budget = budget;
    }

    /// Caps how many bytes a single `read` returns.
    pub fn set_read_limit(&self, limit: Option<usize>) {
        self.lock().read_limit = limit;
    }

    /// Simulates the broker closing the connection.
    pub fn drop_connection(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.inbound.clear();
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.lock().stop_calls
    }

    pub fn last_target(&self) -> Option<(Host, u16)> {
        self.lock().last_target.clone()
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, host: &Host, port: u16) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.connect_calls += 1;
        state.last_target = Some((host.clone(), port));
        if !state.accept_connections {
            return Err(TransportError::ConnectionFailed(format!(
                "{}:{} refused",
                host, port
            )));
        }
        state.connected = true;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let mut state = self.lock();
        if !state.connected {
            return 0;
        }
        let mut n = state.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        if let Some(budget) = state.write_budget.as_mut() {
            n = n.min(*budget);
            *budget -= n;
        }
        state.outbound.extend_from_slice(&buf[..n]);
        n
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.lock();
        if !state.connected {
            return 0;
        }
        let mut n = buf.len().min(state.inbound.len());
        if let Some(limit) = state.read_limit {
            n = n.min(limit);
        }
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn stop(&mut self) {
        let mut state = self.lock();
        state.stop_calls += 1;
        state.connected = false;
    }

    fn connected(&self) -> bool {
        self.lock().connected
    }
}
