//! Transport abstraction layer for MQTT connections
//!
//! The client never blocks on its transport: every method returns immediately with
//! whatever could be done. `connect` may take a moment to establish the connection,
//! but the protocol code only proceeds once [`Transport::connected`] reports true.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::IpAddr;

pub mod memory;
pub mod tcp;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Where the broker lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Host {
    Name(String),
    Ip(IpAddr),
}

impl Default for Host {
    fn default() -> Self {
        Host::Name("localhost".to_string())
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Name(name) => f.write_str(name),
            Host::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

impl From<&str> for Host {
    fn from(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Host::Ip(ip),
            Err(_) => Host::Name(host.to_string()),
        }
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        Host::Ip(ip)
    }
}

/// Non-blocking byte stream to the broker.
pub trait Transport: Send {
    /// Starts a connection to `host:port`.
    fn connect(&mut self, host: &Host, port: u16) -> Result<(), TransportError>;

    /// Writes as much of `buf` as possible and returns how much was taken. 0 means the
    /// transport cannot take more right now.
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Reads whatever is available into `buf`. 0 means nothing to read right now.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Closes the connection. `disconnected` turns true once it is gone.
    fn stop(&mut self);

    fn connected(&self) -> bool;

    fn disconnected(&self) -> bool {
        !self.connected()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self, host: &Host, port: u16) -> Result<(), TransportError> {
        (**self).connect(host, port)
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        (**self).write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        (**self).read(buf)
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn connected(&self) -> bool {
        (**self).connected()
    }

    fn disconnected(&self) -> bool {
        (**self).disconnected()
    }
}

/// Boxed transport for dynamic dispatch
pub type BoxedTransport = Box<dyn Transport>;

// Re-export transport types
pub use memory::MemoryTransport;
pub use tcp::TcpTransport;
