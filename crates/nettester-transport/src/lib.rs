//! # NetTester Transport
//!
//! Datagram transport layer for the NetTester minimal network client.
//!
//! This crate provides:
//! - The [`Transport`] trait: non-blocking datagram send/receive polled from a tick
//! - A UDP socket transport built on `socket2`
//! - An in-process [`MemoryNetwork`] for deterministic tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod transport;
pub mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use transport::{Datagram, Transport, TransportError, TransportResult, TransportStats};
pub use udp::UdpTransport;

use std::time::Duration;

/// Largest datagram a transport will hand back from a receive
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Largest payload one UDP datagram can carry over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size requested from the OS
    pub recv_buffer_size: usize,
    /// Send buffer size requested from the OS
    pub send_buffer_size: usize,
    /// Connection timeout floor imposed by this transport
    pub default_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
            default_timeout: Duration::from_secs(30),
        }
    }
}
