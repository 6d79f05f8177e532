// SPDX-License-Identifier: MPL-2.0

//! TCP transport implementation

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Host, Transport, TransportError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Non-blocking TCP transport on top of `std::net::TcpStream`.
///
/// `connect` resolves the host and waits up to the connect timeout for the socket;
/// afterwards every read and write is non-blocking.
///
/// The wait happens inside [`MqttClient::process`](crate::mqtt_client::MqttClient::process)
/// with the engine lock held, so other calls on the same client (`publish`,
/// `queue_size`...) block until it ends. Keep the timeout short, 2 s by default, or
/// pick one with [`with_connect_timeout`](Self::with_connect_timeout).
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            stream: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            stream: None,
            connect_timeout,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Get the peer address as a string
    pub fn peer_addr(&self) -> Result<String, TransportError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| TransportError::ConnectionFailed("not connected".to_string()))?;
        stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .map_err(TransportError::Io)
    }

    fn resolve(host: &Host, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
        let addrs: Vec<SocketAddr> = match host {
            Host::Ip(ip) => vec![SocketAddr::new(*ip, port)],
            Host::Name(name) => (name.as_str(), port)
                .to_socket_addrs()
                .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", name, e)))?
                .collect(),
        };
        if addrs.is_empty() {
            return Err(TransportError::InvalidAddress(host.to_string()));
        }
        Ok(addrs)
    }

    fn drop_stream(&mut self, error: &io::Error) {
        warn!(%error, "tcp connection lost");
        self.stream = None;
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &Host, port: u16) -> Result<(), TransportError> {
        let mut last_error = None;
        for addr in Self::resolve(host, port)? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    debug!(%addr, "tcp connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(TransportError::ConnectionFailed(format!(
            "TCP connection to {}:{} failed: {}",
            host,
            port,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };
        match stream.write(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => {
                self.drop_stream(&e);
                0
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                debug!("tcp connection closed by peer");
                self.stream = None;
                0
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => {
                self.drop_stream(&e);
                0
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            // the peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn connected(&self) -> bool {
        self.stream.is_some()
    }
}
