//! In-process datagram network.
//!
//! A [`MemoryNetwork`] is a shared switchboard of address → queue. Transports
//! bound on it behave like UDP sockets: sends to unbound addresses vanish,
//! delivery is in send order per destination, and nothing blocks. Tests use
//! the drop filter to simulate packet loss, a send budget to simulate a full
//! send buffer and [`MemoryNetwork::inject`] to deliver raw bytes from an
//! arbitrary address.

use crate::transport::{Datagram, Transport, TransportError, TransportResult, TransportStats};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// First port handed out for `:0` binds
const EPHEMERAL_PORT_START: u16 = 49152;

/// Predicate deciding whether a datagram is dropped in flight: `(from, to, bytes)`
type DropFilter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send>;

#[derive(Default)]
struct NetworkState {
    queues: HashMap<SocketAddr, VecDeque<Datagram>>,
    next_port: u16,
    drop_filter: Option<DropFilter>,
    dropped: u64,
    // Sends accepted before senders see WouldBlock; None is unlimited
    send_budget: Option<usize>,
}

impl NetworkState {
    /// Resolve a destination, falling back to a wildcard bind on the same port
    fn route(&self, to: SocketAddr) -> Option<SocketAddr> {
        if self.queues.contains_key(&to) {
            return Some(to);
        }
        let wildcard = SocketAddr::new(unspecified_like(to.ip()), to.port());
        self.queues.contains_key(&wildcard).then_some(wildcard)
    }
}

fn loopback_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        // A panicking test thread must not poison the network for the rest
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Bind a transport on this network.
    ///
    /// Port 0 picks an ephemeral port; an unspecified IP with port 0 binds
    /// on loopback so replies have a routable source address.
    ///
    /// # Errors
    /// Returns `TransportError::AddrInUse` if the address is already bound.
    pub fn bind(&self, addr: SocketAddr) -> TransportResult<MemoryTransport> {
        let mut state = self.lock();

        let local = if addr.port() == 0 {
            let ip = if addr.ip().is_unspecified() {
                loopback_like(addr.ip())
            } else {
                addr.ip()
            };
            loop {
                let port = EPHEMERAL_PORT_START.wrapping_add(state.next_port);
                state.next_port = state.next_port.wrapping_add(1);
                let candidate = SocketAddr::new(ip, port.max(EPHEMERAL_PORT_START));
                if !state.queues.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            addr
        };

        if state.queues.contains_key(&local) {
            return Err(TransportError::AddrInUse(local));
        }
        state.queues.insert(local, VecDeque::new());

        tracing::trace!("memory transport bound to {}", local);

        Ok(MemoryTransport {
            network: self.clone(),
            local,
            closed: false,
            default_timeout: Duration::ZERO,
            stats: TransportStats::new(),
        })
    }

    /// Install a filter that drops matching datagrams in flight
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send + 'static,
    {
        self.lock().drop_filter = Some(Box::new(filter));
    }

    /// Remove the drop filter
    pub fn clear_drop_filter(&self) {
        self.lock().drop_filter = None;
    }

    /// Number of datagrams dropped by the filter so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Accept only `budget` more sends network-wide, then report
    /// `TransportError::WouldBlock` until the budget is lifted with `None`
    pub fn set_send_budget(&self, budget: Option<usize>) {
        self.lock().send_budget = budget;
    }

    fn take_send_slot(&self) -> bool {
        let mut state = self.lock();
        match state.send_budget.as_mut() {
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => true,
        }
    }

    /// Number of datagrams queued for `addr`
    #[must_use]
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().queues.get(&addr).map_or(0, VecDeque::len)
    }

    /// Deliver raw bytes to `to` as if sent from `from`.
    ///
    /// Returns false if nothing is bound at `to`.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) -> bool {
        let mut state = self.lock();
        match state.route(to) {
            Some(dest) => {
                if let Some(queue) = state.queues.get_mut(&dest) {
                    queue.push_back(Datagram {
                        from,
                        data: data.to_vec(),
                    });
                }
                true
            }
            None => false,
        }
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut state = self.lock();

        let drop = match state.drop_filter.as_mut() {
            Some(filter) => filter(from, to, data),
            None => false,
        };
        if drop {
            state.dropped += 1;
            tracing::trace!("memory network dropped {} bytes {} -> {}", data.len(), from, to);
            return;
        }

        if let Some(dest) = state.route(to) {
            if let Some(queue) = state.queues.get_mut(&dest) {
                queue.push_back(Datagram {
                    from,
                    data: data.to_vec(),
                });
            }
        }
    }

    fn pop(&self, addr: SocketAddr) -> Option<Datagram> {
        self.lock().queues.get_mut(&addr).and_then(VecDeque::pop_front)
    }

    fn unbind(&self, addr: SocketAddr) {
        self.lock().queues.remove(&addr);
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryNetwork")
            .field("bound", &state.queues.len())
            .field("dropped", &state.dropped)
            .finish()
    }
}

/// Transport bound on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: SocketAddr,
    closed: bool,
    default_timeout: Duration,
    stats: TransportStats,
}

impl MemoryTransport {
    /// Set the timeout floor reported to connections
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Source address stamped on outgoing datagrams.
    ///
    /// A wildcard bind sends from loopback, as a kernel would for local peers.
    fn source_addr(&self) -> SocketAddr {
        if self.local.ip().is_unspecified() {
            SocketAddr::new(loopback_like(self.local.ip()), self.local.port())
        } else {
            self.local
        }
    }
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed {
            self.stats.record_send_error();
            return Err(TransportError::Closed);
        }
        if !self.network.take_send_slot() {
            return Err(TransportError::WouldBlock);
        }
        self.network.deliver(self.source_addr(), addr, buf);
        self.stats.record_send(buf.len());
        Ok(buf.len())
    }

    fn try_recv(&mut self) -> TransportResult<Option<Datagram>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let datagram = self.network.pop(self.local);
        if let Some(datagram) = &datagram {
            self.stats.record_recv(datagram.data.len());
        }
        Ok(datagram)
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.local)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.network.unbind(self.local);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
