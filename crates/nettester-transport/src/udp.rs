//! UDP socket transport.
//!
//! Standard UDP sockets configured through `socket2`:
//! - Non-blocking I/O, polled from the client tick
//! - Configurable socket buffer sizes
//! - IPv4 and IPv6

use crate::transport::{Datagram, Transport, TransportError, TransportResult, TransportStats};
use crate::{MAX_DATAGRAM_SIZE, TransportConfig};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// UDP transport over a non-blocking OS socket
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    recv_buf: Vec<u8>,
    recv_buffer_size: usize,
    send_buffer_size: usize,
    default_timeout: Duration,
    stats: TransportStats,
}

impl UdpTransport {
    /// Create a new UDP transport bound to the given address
    ///
    /// # Arguments
    /// * `addr` - The local address to bind to. Use "0.0.0.0:0" for automatic port selection.
    /// * `config` - Buffer sizes and timeout floor
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created or bound.
    ///
    /// # Examples
    /// ```no_run
    /// use nettester_transport::{TransportConfig, UdpTransport};
    /// use std::net::SocketAddr;
    ///
    /// let addr: SocketAddr = "127.0.0.1:7777".parse().unwrap();
    /// let transport = UdpTransport::bind(addr, &TransportConfig::default()).unwrap();
    /// ```
    pub fn bind(addr: SocketAddr, config: &TransportConfig) -> TransportResult<Self> {
        if config.recv_buffer_size == 0 || config.send_buffer_size == 0 {
            return Err(TransportError::InvalidConfig(
                "socket buffer sizes must be non-zero".to_string(),
            ));
        }

        Self::open(addr, config).map_err(|e| {
            tracing::warn!("UDP bind to {} failed: {}", addr, e);
            TransportError::BindFailed(format!("{addr}: {e}"))
        })
    }

    fn open(addr: SocketAddr, config: &TransportConfig) -> io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket2 = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_nonblocking(true)?;
        socket2.set_recv_buffer_size(config.recv_buffer_size)?;
        socket2.set_send_buffer_size(config.send_buffer_size)?;

        // The kernel may round the requested sizes
        let recv_buffer_size = socket2.recv_buffer_size()?;
        let send_buffer_size = socket2.send_buffer_size()?;

        socket2.bind(&addr.into())?;

        let socket: UdpSocket = socket2.into();
        let local_addr = socket.local_addr()?;

        tracing::debug!(
            "UDP transport bound to {} (rx buffer {}, tx buffer {})",
            local_addr,
            recv_buffer_size,
            send_buffer_size
        );

        Ok(Self {
            socket: Some(socket),
            local_addr,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            recv_buffer_size,
            send_buffer_size,
            default_timeout: config.default_timeout,
            stats: TransportStats::new(),
        })
    }

    /// Get the receive buffer size in bytes
    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    /// Get the send buffer size in bytes
    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer_size
    }

    fn socket(&self) -> TransportResult<&UdpSocket> {
        self.socket.as_ref().ok_or(TransportError::Closed)
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        let result = self.socket()?.send_to(buf, addr);
        match result {
            Ok(sent) => {
                self.stats.record_send(sent);
                Ok(sent)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TransportError::WouldBlock),
            Err(e) => {
                self.stats.record_send_error();
                Err(e.into())
            }
        }
    }

    fn try_recv(&mut self) -> TransportResult<Option<Datagram>> {
        loop {
            let result = match self.socket.as_ref() {
                Some(socket) => socket.recv_from(&mut self.recv_buf),
                None => return Err(TransportError::Closed),
            };

            match result {
                Ok((size, from)) => {
                    self.stats.record_recv(size);
                    return Ok(Some(Datagram {
                        from,
                        data: self.recv_buf[..size].to_vec(),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP unreachable from an earlier send, reported on some platforms
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    self.stats.record_recv_error();
                    tracing::trace!("Ignoring ICMP error on {}: {}", self.local_addr, e);
                }
                Err(e) => {
                    self.stats.record_recv_error();
                    return Err(e.into());
                }
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket()?;
        Ok(self.local_addr)
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            tracing::debug!("UDP transport on {} closed", self.local_addr);
        }
    }

    fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
