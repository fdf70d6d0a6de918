//! Transport trait abstraction for datagram backends.
//!
//! The NetTester core is driven from a single fixed-rate tick, so every
//! transport operation here is a non-blocking poll: a receive with nothing
//! pending returns `Ok(None)` instead of waiting.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Send buffer is full; the datagram was not sent and may be retried
    #[error("Send would block")]
    WouldBlock,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Address already bound by another transport
    #[error("Address already in use: {0}")]
    AddrInUse(SocketAddr),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Whether the failure is transient and the send can be retried later
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        match self {
            Self::WouldBlock => true,
            Self::Io(err) => err.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A datagram received from a remote address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sender address
    pub from: SocketAddr,
    /// Datagram contents
    pub data: Vec<u8>,
}

/// Non-blocking datagram transport.
///
/// Implementations never block: `try_recv` returns `Ok(None)` when no
/// datagram is pending and `send_to` either hands the datagram to the
/// network, reports `TransportError::WouldBlock` when the send buffer is
/// full, or fails.
///
/// # Examples
///
/// ```no_run
/// use nettester_transport::{Transport, UdpTransport, TransportConfig};
/// use std::net::SocketAddr;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let mut transport = UdpTransport::bind(addr, &TransportConfig::default())?;
///
/// transport.send_to(b"hello", "127.0.0.1:7777".parse()?)?;
///
/// while let Some(datagram) = transport.try_recv()? {
///     println!("{} bytes from {}", datagram.data.len(), datagram.from);
/// }
/// # Ok(())
/// # }
/// ```
pub trait Transport: Send {
    /// Send one datagram to a remote address.
    ///
    /// # Errors
    /// Returns `TransportError` if the transport is closed or the OS rejects the send
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Poll for one pending datagram.
    ///
    /// # Errors
    /// Returns `TransportError` if the transport is closed or the receive fails
    fn try_recv(&mut self) -> TransportResult<Option<Datagram>>;

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport and release the bound address.
    ///
    /// Closing twice is a no-op.
    fn close(&mut self);

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Timeout floor for connections running over this transport.
    fn default_timeout(&self) -> Duration {
        Duration::ZERO
    }

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats() {
        let mut stats = TransportStats::new();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.packets_sent, 0);

        stats.record_send(100);
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.packets_sent, 1);

        stats.record_recv(200);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.packets_received, 1);

        stats.record_send_error();
        assert_eq!(stats.send_errors, 1);

        stats.record_recv_error();
        assert_eq!(stats.recv_errors, 1);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::BindFailed("test".to_string());
        assert!(err.to_string().contains("Failed to bind"));

        let err = TransportError::AddrInUse("127.0.0.1:7777".parse().unwrap());
        assert_eq!(err.to_string(), "Address already in use: 127.0.0.1:7777");

        let err = TransportError::InvalidConfig("zero buffer".to_string());
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = std::io::Error::other("test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
        assert!(!transport_err.is_would_block());
    }

    #[test]
    fn test_would_block_is_transient() {
        assert!(TransportError::WouldBlock.is_would_block());
        let io_err = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert!(TransportError::from(io_err).is_would_block());
        assert!(!TransportError::Closed.is_would_block());
    }
}
