//! Net driver: one transport and the connections running over it.
//!
//! A listening driver accepts a Connection per peer address on the first
//! Hello from that address. A connecting driver holds exactly one outbound
//! Connection. Either way the driver demultiplexes incoming datagrams by
//! source address and pumps every connection in creation order.

use crate::channel::{ChannelAcceptor, ChannelKind};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionId, Role};
use crate::error::{ClientError, ConnectionError};
use crate::events::EventSink;
use crate::frame::{encode_text, Packet, PacketType};
use crate::TEXT_CHANNEL;
use nettester_transport::{Transport, TransportError, TransportStats};
use std::net::SocketAddr;
use std::time::Duration;

/// Most datagrams drained from the transport in one receive pump
const MAX_DATAGRAMS_PER_PUMP: usize = 4096;

/// Owner of the transport for one listen/connect cycle
pub struct NetDriver {
    role: Role,
    transport: Box<dyn Transport>,
    local_addr: SocketAddr,
    config: ConnectionConfig,
    max_connections: usize,
    connections: Vec<Connection>,
    next_id: u64,
}

impl NetDriver {
    /// Start listening on an already bound transport.
    ///
    /// Accepted connections take IDs starting at `first_id`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the transport has no local address.
    pub fn listen_init(
        transport: Box<dyn Transport>,
        config: ConnectionConfig,
        max_connections: usize,
        first_id: u64,
    ) -> Result<Self, TransportError> {
        let local_addr = transport.local_addr()?;
        tracing::info!("Listening on {}", local_addr);
        Ok(Self {
            role: Role::Listener,
            transport,
            local_addr,
            config,
            max_connections,
            connections: Vec::new(),
            next_id: first_id.max(1),
        })
    }

    /// Create the single outbound connection to `remote`.
    ///
    /// Returns immediately; the Hello goes out with [`NetDriver::send_initial_join`].
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the transport has no local address.
    pub fn connect_init(
        transport: Box<dyn Transport>,
        remote: SocketAddr,
        config: ConnectionConfig,
        first_id: u64,
        now: Duration,
    ) -> Result<Self, TransportError> {
        let local_addr = transport.local_addr()?;
        let id = ConnectionId::new(first_id.max(1));
        let connection = Connection::new(
            id,
            Role::Outbound,
            remote,
            config.clone(),
            transport.default_timeout(),
            now,
        );
        tracing::info!("Connecting to {} from {}", remote, local_addr);
        Ok(Self {
            role: Role::Outbound,
            transport,
            local_addr,
            config,
            max_connections: 1,
            connections: vec![connection],
            next_id: id.as_u64() + 1,
        })
    }

    /// Get the driver role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the bound local address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// ID the next connection would receive
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Connections in creation order
    #[must_use]
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// The outbound connection of a connecting driver
    #[must_use]
    pub fn outbound(&self) -> Option<&Connection> {
        match self.role {
            Role::Outbound => self.connections.first(),
            Role::Listener => None,
        }
    }

    /// Transport counters
    #[must_use]
    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Send the outbound Hello and flush it right away
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` unless this is a connecting driver whose
    /// connection has not started its handshake.
    pub fn send_initial_join(
        &mut self,
        now: Duration,
        events: &mut dyn EventSink,
    ) -> Result<(), ConnectionError> {
        if self.role != Role::Outbound {
            return Err(ConnectionError::Closed);
        }
        let connection = self
            .connections
            .first_mut()
            .ok_or(ConnectionError::Closed)?;
        connection.send_initial_join(now)?;
        connection.flush(now, self.transport.as_mut(), events);
        Ok(())
    }

    /// Drain the transport into connection inbound queues, then dispatch
    pub fn pump_receive(
        &mut self,
        now: Duration,
        events: &mut dyn EventSink,
        acceptor: &dyn ChannelAcceptor,
    ) {
        for _ in 0..MAX_DATAGRAMS_PER_PUMP {
            match self.transport.try_recv() {
                Ok(Some(datagram)) => self.route(datagram.from, datagram.data, now),
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("Receive on {} failed: {}", self.local_addr, err);
                    break;
                }
            }
        }

        for connection in &mut self.connections {
            connection.pump_receive(now, events, acceptor);
        }
    }

    fn route(&mut self, from: SocketAddr, data: Vec<u8>, now: Duration) {
        if let Some(connection) = self
            .connections
            .iter_mut()
            .find(|c| c.remote() == from && !c.is_closed())
        {
            connection.enqueue_inbound(data);
            return;
        }

        if self.role == Role::Outbound {
            tracing::trace!("Dropping {} bytes from unexpected peer {}", data.len(), from);
            return;
        }

        if data.first() != Some(&(PacketType::Hello as u8)) {
            tracing::trace!("Dropping {} bytes from unknown peer {}", data.len(), from);
            return;
        }

        let live = self.connections.iter().filter(|c| !c.is_closed()).count();
        if live >= self.max_connections {
            tracing::warn!(
                "Refusing {}: {} connections already accepted",
                from,
                live
            );
            let reject = Packet::Reject("server full").encode();
            if let Err(err) = self.transport.send_to(&reject, from) {
                tracing::warn!("Reject to {} failed: {}", from, err);
            }
            return;
        }

        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        let mut connection = Connection::new(
            id,
            Role::Listener,
            from,
            self.config.clone(),
            self.transport.default_timeout(),
            now,
        );
        connection.enqueue_inbound(data);
        self.connections.push(connection);
    }

    /// Run timers and flush every connection
    pub fn pump_send(&mut self, now: Duration, events: &mut dyn EventSink) {
        for connection in &mut self.connections {
            connection.pump_send(now, self.transport.as_mut(), events);
        }
    }

    /// Drop closed accepted connections, returning how many were removed
    pub fn reap_closed(&mut self) -> usize {
        if self.role != Role::Listener {
            return 0;
        }
        let before = self.connections.len();
        self.connections.retain(|c| {
            if c.is_closed() {
                tracing::debug!("Reaping connection {}", c.id());
            }
            !c.is_closed()
        });
        before - self.connections.len()
    }

    /// Whether the cycle has nothing left to do: a connecting driver whose
    /// connection closed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.outbound().is_some_and(Connection::is_closed)
    }

    /// Send a payload on a channel of every eligible connection, flushing each.
    ///
    /// A connecting driver writes to its one connection; a listening driver
    /// writes to every open connection. Returns the number written to.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotConnected` when nothing can be written to and
    /// `ClientError::Channel` when the outbound connection refuses the send.
    pub fn send(
        &mut self,
        channel: u16,
        payload: &[u8],
        reliable: bool,
        now: Duration,
        events: &mut dyn EventSink,
    ) -> Result<usize, ClientError> {
        match self.role {
            Role::Outbound => {
                let connection = self
                    .connections
                    .first_mut()
                    .filter(|c| !c.is_closed())
                    .ok_or(ClientError::NotConnected)?;
                connection.send(channel, payload, reliable, now)?;
                connection.flush(now, self.transport.as_mut(), events);
                Ok(1)
            }
            Role::Listener => {
                let mut written = 0;
                for connection in self.connections.iter_mut().filter(|c| c.is_open()) {
                    match connection.send(channel, payload, reliable, now) {
                        Ok(_) => {
                            connection.flush(now, self.transport.as_mut(), events);
                            written += 1;
                        }
                        Err(err) => {
                            tracing::warn!("Send to connection {} failed: {}", connection.id(), err);
                        }
                    }
                }
                if written == 0 {
                    return Err(ClientError::NotConnected);
                }
                Ok(written)
            }
        }
    }

    /// Send a text message on the Text channel. See [`NetDriver::send`].
    ///
    /// # Errors
    ///
    /// See [`NetDriver::send`].
    pub fn send_text(
        &mut self,
        text: &str,
        now: Duration,
        events: &mut dyn EventSink,
    ) -> Result<usize, ClientError> {
        self.send(TEXT_CHANNEL, &encode_text(text), true, now, events)
    }

    /// Register a channel on every live connection, returning how many took it
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotConnected` if no live connection exists and
    /// `ClientError::Channel` if a connection already has the index.
    pub fn open_channel(&mut self, index: u16, kind: ChannelKind) -> Result<usize, ClientError> {
        let mut opened = 0;
        for connection in self.connections.iter_mut().filter(|c| !c.is_closed()) {
            connection.open_channel(index, kind)?;
            opened += 1;
        }
        if opened == 0 {
            return Err(ClientError::NotConnected);
        }
        Ok(opened)
    }

    /// Raise the timeout of every live connection
    pub fn reset_timeouts(&mut self, timeout: Duration, now: Duration) {
        for connection in &mut self.connections {
            connection.reset_timeout(timeout, now);
        }
    }

    /// Close every connection and flush the Close packets
    pub fn close_all(&mut self, now: Duration, events: &mut dyn EventSink) {
        for connection in &mut self.connections {
            connection.close(events);
            connection.flush(now, self.transport.as_mut(), events);
        }
    }

    /// Close the transport
    pub fn shutdown(&mut self) {
        self.transport.close();
        tracing::debug!("Transport on {} shut down", self.local_addr);
    }
}

impl std::fmt::Debug for NetDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetDriver")
            .field("role", &self.role)
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.len())
            .finish()
    }
}
